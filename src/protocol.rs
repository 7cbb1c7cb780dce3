use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{error::ParseError, events::GameEvent};

#[derive(Debug, Clone, Deserialize)]
struct JsonRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    event: GameEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub id: Option<String>,
    pub event: GameEvent,
    /// False when the event time fell back to the observation time.
    pub stamped: bool,
}

impl ParsedRecord {
    fn derived(event: GameEvent) -> Self {
        Self {
            id: None,
            event,
            stamped: false,
        }
    }
}

/// Parses one engine record. `Ok(None)` means the line is chatter that carries
/// no game event; `Err` means it looked like a record but could not be used.
pub fn parse_line(line: &str, observed_at: DateTime<Utc>) -> Result<Option<ParsedRecord>, ParseError> {
    let line = line.trim().trim_start_matches('\u{feff}');
    if line.is_empty() {
        return Ok(None);
    }
    if line.starts_with('{') {
        return parse_json_record(line).map(Some);
    }

    let (stamp, rest) = split_timestamp_prefix(line)?;
    let record = parse_text_record(rest, stamp.unwrap_or(observed_at))?;
    Ok(record.map(|record| ParsedRecord {
        stamped: stamp.is_some(),
        ..record
    }))
}

fn parse_json_record(line: &str) -> Result<ParsedRecord, ParseError> {
    let record = serde_json::from_str::<JsonRecord>(line)
        .map_err(|err| ParseError::InvalidJson(err.to_string()))?;
    let event = normalize_event(record.event)?;
    Ok(ParsedRecord {
        id: record.id,
        event,
        stamped: true,
    })
}

fn normalize_event(event: GameEvent) -> Result<GameEvent, ParseError> {
    match event {
        GameEvent::Kill {
            actor,
            target,
            weapon,
            headshot,
            melee,
            midair,
            distance,
            at,
        } => {
            let actor = required_name(&actor, "actor")?;
            let target = required_name(&target, "target")?;
            if actor == target {
                return Ok(GameEvent::Death {
                    actor,
                    killer: None,
                    at,
                });
            }
            Ok(GameEvent::Kill {
                actor,
                target,
                weapon: optional_text(weapon.as_deref()),
                headshot,
                melee,
                midair,
                distance: distance.filter(|value| value.is_finite() && *value >= 0.0),
                at,
            })
        }
        GameEvent::Death { actor, killer, at } => {
            let actor = required_name(&actor, "actor")?;
            let killer = optional_text(killer.as_deref()).filter(|killer| *killer != actor);
            Ok(GameEvent::Death { actor, killer, at })
        }
        GameEvent::MatchEnd { winner, at } => Ok(GameEvent::MatchEnd {
            winner: optional_text(winner.as_deref()),
            at,
        }),
        GameEvent::CustomBonus {
            actor,
            amount,
            reason,
            at,
        } => {
            let actor = required_name(&actor, "actor")?;
            if amount <= Decimal::ZERO {
                return Err(ParseError::InvalidAmount(amount.to_string()));
            }
            Ok(GameEvent::CustomBonus {
                actor,
                amount,
                reason: optional_text(reason.as_deref()),
                at,
            })
        }
    }
}

fn split_timestamp_prefix(line: &str) -> Result<(Option<DateTime<Utc>>, &str), ParseError> {
    let Some(stripped) = line.strip_prefix('[') else {
        return Ok((None, line));
    };
    let Some(end_idx) = stripped.find(']') else {
        return Ok((None, line));
    };
    let raw = stripped[..end_idx].trim();
    if raw.is_empty() || !raw.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
        return Ok((None, line));
    }
    let seconds = raw
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidTimestamp(raw.to_owned()))?;
    let at = timestamp_to_utc(seconds).ok_or_else(|| ParseError::InvalidTimestamp(raw.to_owned()))?;
    Ok((Some(at), stripped[(end_idx + 1)..].trim_start()))
}

fn parse_text_record(line: &str, at: DateTime<Utc>) -> Result<Option<ParsedRecord>, ParseError> {
    if let Some(rest) = line.strip_prefix(":kill:") {
        return parse_eventlog_kill(rest, at).map(Some);
    }

    let lower = line.to_ascii_lowercase();
    if line.starts_with(":end") || lower.contains("match ended") || lower.contains("match over") {
        return Ok(Some(ParsedRecord::derived(GameEvent::MatchEnd {
            winner: None,
            at,
        })));
    }

    for marker in [" was fragged by ", " was killed by "] {
        if let Some((victim, killer)) = line.split_once(marker) {
            let (killer, weapon) = split_weapon_suffix(killer);
            return kill_or_suicide(killer, victim, weapon, at).map(Some);
        }
    }
    if let Some((killer, victim)) = line.split_once(" fragged ") {
        let (victim, weapon) = split_weapon_suffix(victim);
        return kill_or_suicide(killer, victim, weapon, at).map(Some);
    }
    if let Some(actor) = line.strip_suffix(" died") {
        let actor = required_name(actor, "actor")?;
        return Ok(Some(ParsedRecord::derived(GameEvent::Death {
            actor,
            killer: None,
            at,
        })));
    }
    Ok(None)
}

fn parse_eventlog_kill(rest: &str, at: DateTime<Utc>) -> Result<ParsedRecord, ParseError> {
    // <a>:<b>:<c>:<killer>:<victim>[:<weapon>]
    let fields: Vec<&str> = rest.split(':').collect();
    if fields.len() < 5 {
        return Err(ParseError::MissingField("killer and victim"));
    }
    let weapon = fields.get(5).copied();
    kill_or_suicide(fields[3], fields[4], weapon, at)
}

fn split_weapon_suffix(value: &str) -> (&str, Option<&str>) {
    match value.split_once(" with ") {
        Some((name, weapon)) => (name, Some(weapon)),
        None => (value, None),
    }
}

fn kill_or_suicide(
    killer: &str,
    victim: &str,
    weapon: Option<&str>,
    at: DateTime<Utc>,
) -> Result<ParsedRecord, ParseError> {
    let killer = required_name(killer, "killer")?;
    let victim = required_name(victim, "victim")?;
    if killer == victim {
        return Ok(ParsedRecord::derived(GameEvent::Death {
            actor: victim,
            killer: None,
            at,
        }));
    }
    Ok(ParsedRecord::derived(GameEvent::Kill {
        actor: killer,
        target: victim,
        weapon: optional_text(weapon),
        headshot: false,
        melee: false,
        midair: false,
        distance: None,
        at,
    }))
}

fn required_name(value: &str, field: &'static str) -> Result<String, ParseError> {
    optional_text(Some(value)).ok_or(ParseError::MissingField(field))
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().trim_end_matches(['!', '.']).trim())
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

fn timestamp_to_utc(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() || timestamp < 0.0 {
        return None;
    }
    let millis = (timestamp * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}
