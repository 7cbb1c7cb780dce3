use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{combo::ComboState, rank::StyleMeter};

#[derive(Debug, Clone)]
pub struct PlayerState {
    pub name: String,
    pub meter: StyleMeter,
    pub combo: ComboState,
    pub killstreak: u32,
    pub best_streak: u32,
    pub last_killer: Option<String>,
    pub victims: HashMap<String, u32>,
    pub kills: u32,
    pub deaths: u32,
    pub last_seen: DateTime<Utc>,
}

impl PlayerState {
    fn new(name: &str, at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_owned(),
            meter: StyleMeter::default(),
            combo: ComboState::Idle,
            killstreak: 0,
            best_streak: 0,
            last_killer: None,
            victims: HashMap::new(),
            kills: 0,
            deaths: 0,
            last_seen: at,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Returns how many times this player has now killed `victim`.
    pub fn record_victim(&mut self, victim: &str) -> u32 {
        let count = self.victims.entry(victim.to_owned()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn kd(&self) -> f32 {
        self.kills as f32 / self.deaths.max(1) as f32
    }

    pub fn standing(&self) -> Standing {
        Standing {
            player: self.name.clone(),
            kills: self.kills,
            deaths: self.deaths,
            best_streak: self.best_streak,
            kd: self.kd(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standing {
    pub player: String,
    pub kills: u32,
    pub deaths: u32,
    pub best_streak: u32,
    pub kd: f32,
}

/// Owns every in-memory player record. Ledger rows live independently.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: HashMap<String, PlayerState>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, name: &str, at: DateTime<Utc>) -> &mut PlayerState {
        let player = self
            .players
            .entry(name.to_owned())
            .or_insert_with(|| PlayerState::new(name, at));
        player.touch(at);
        player
    }

    pub fn get(&self, name: &str) -> Option<&PlayerState> {
        self.players.get(name)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn evict_idle(&mut self, now: DateTime<Utc>, idle_for: Duration) -> usize {
        let before = self.players.len();
        self.players
            .retain(|_, player| now.signed_duration_since(player.last_seen) < idle_for);
        before - self.players.len()
    }

    /// Standings sorted by kills, then by fewer deaths, then by name.
    pub fn standings(&self) -> Vec<Standing> {
        let mut out: Vec<Standing> = self
            .players
            .values()
            .filter(|player| player.kills > 0 || player.deaths > 0)
            .map(PlayerState::standing)
            .collect();
        out.sort_by(|a, b| {
            b.kills
                .cmp(&a.kills)
                .then(a.deaths.cmp(&b.deaths))
                .then_with(|| a.player.cmp(&b.player))
        });
        out
    }

    /// Clears match-scoped state. Style meters carry over; chains do not.
    pub fn reset_match(&mut self) {
        for player in self.players.values_mut() {
            player.combo = ComboState::Idle;
            player.killstreak = 0;
            player.best_streak = 0;
            player.last_killer = None;
            player.victims.clear();
            player.kills = 0;
            player.deaths = 0;
        }
    }
}
