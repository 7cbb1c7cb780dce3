use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    Kill {
        actor: String,
        target: String,
        #[serde(default)]
        weapon: Option<String>,
        #[serde(default)]
        headshot: bool,
        #[serde(default)]
        melee: bool,
        #[serde(default)]
        midair: bool,
        #[serde(default)]
        distance: Option<f32>,
        at: DateTime<Utc>,
    },
    Death {
        actor: String,
        #[serde(default)]
        killer: Option<String>,
        at: DateTime<Utc>,
    },
    MatchEnd {
        #[serde(default)]
        winner: Option<String>,
        at: DateTime<Utc>,
    },
    CustomBonus {
        actor: String,
        amount: Decimal,
        #[serde(default)]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Kill,
    Death,
    MatchEnd,
    CustomBonus,
}

impl GameEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GameEvent::Kill { .. } => EventKind::Kill,
            GameEvent::Death { .. } => EventKind::Death,
            GameEvent::MatchEnd { .. } => EventKind::MatchEnd,
            GameEvent::CustomBonus { .. } => EventKind::CustomBonus,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            GameEvent::Kill { at, .. }
            | GameEvent::Death { at, .. }
            | GameEvent::MatchEnd { at, .. }
            | GameEvent::CustomBonus { at, .. } => *at,
        }
    }

    pub fn label(&self) -> String {
        match self {
            GameEvent::Kill {
                actor,
                target,
                weapon,
                headshot,
                ..
            } => {
                let mut label = format!("{actor} killed {target}");
                if let Some(weapon) = weapon {
                    label.push_str(&format!(" [{weapon}]"));
                }
                if *headshot {
                    label.push_str(" HS");
                }
                label
            }
            GameEvent::Death {
                actor,
                killer: Some(killer),
                ..
            } => format!("{actor} killed by {killer}"),
            GameEvent::Death { actor, .. } => format!("{actor} died"),
            GameEvent::MatchEnd {
                winner: Some(winner),
                ..
            } => format!("match won by {winner}"),
            GameEvent::MatchEnd { .. } => "match ended".to_owned(),
            GameEvent::CustomBonus {
                actor,
                amount,
                reason,
                ..
            } => match reason {
                Some(reason) => format!("{actor} bonus {amount} ({reason})"),
                None => format!("{actor} bonus {amount}"),
            },
        }
    }
}

/// Where a followed log file stood right after the line of an event.
/// `head` is the start of the file and `anchor` the bytes just before
/// `offset`; both must still match for a restart to resume there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPosition {
    pub offset: u64,
    pub head: Arc<[u8]>,
    pub anchor: Vec<u8>,
}

/// An event tagged with where it came from. `id` is the idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub id: String,
    pub source: String,
    pub seq: u64,
    pub event: GameEvent,
    pub position: Option<LogPosition>,
}

impl FeedEvent {
    pub fn new(source: &str, seq: u64, explicit_id: Option<String>, event: GameEvent) -> Self {
        let id = explicit_id
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("{source}:{seq}"));
        Self {
            id,
            source: source.to_owned(),
            seq,
            event,
            position: None,
        }
    }

    pub fn with_position(mut self, position: LogPosition) -> Self {
        self.position = Some(position);
        self
    }
}
