use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::StyleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StyleRank {
    D,
    C,
    B,
    A,
    S,
    SS,
    SSS,
}

struct RankRow {
    rank: StyleRank,
    title: &'static str,
    threshold: f64,
    multiplier_tenths: i64,
    color: u32,
}

// Canonical table: SS = SLASHING 4.0x, SSS = SATOSHI 5.0x.
const RANK_TABLE: [RankRow; 7] = [
    RankRow {
        rank: StyleRank::D,
        title: "DORMANT",
        threshold: 0.0,
        multiplier_tenths: 10,
        color: 0x80_80_80,
    },
    RankRow {
        rank: StyleRank::C,
        title: "CALCULATING",
        threshold: 100.0,
        multiplier_tenths: 12,
        color: 0x00_FF_FF,
    },
    RankRow {
        rank: StyleRank::B,
        title: "BUILDING",
        threshold: 300.0,
        multiplier_tenths: 15,
        color: 0x00_FF_00,
    },
    RankRow {
        rank: StyleRank::A,
        title: "ATTACKING",
        threshold: 600.0,
        multiplier_tenths: 20,
        color: 0xFF_FF_00,
    },
    RankRow {
        rank: StyleRank::S,
        title: "STAKING",
        threshold: 1000.0,
        multiplier_tenths: 30,
        color: 0xFF_88_00,
    },
    RankRow {
        rank: StyleRank::SS,
        title: "SLASHING",
        threshold: 1500.0,
        multiplier_tenths: 40,
        color: 0xFF_00_00,
    },
    RankRow {
        rank: StyleRank::SSS,
        title: "SATOSHI",
        threshold: 2500.0,
        multiplier_tenths: 50,
        color: 0xFF_D7_00,
    },
];

impl StyleRank {
    fn row(self) -> &'static RankRow {
        &RANK_TABLE[self as usize]
    }

    pub fn from_meter(value: f64) -> Self {
        RANK_TABLE
            .iter()
            .rev()
            .find(|row| value >= row.threshold)
            .map(|row| row.rank)
            .unwrap_or(StyleRank::D)
    }

    pub fn label(self) -> &'static str {
        match self {
            StyleRank::D => "D",
            StyleRank::C => "C",
            StyleRank::B => "B",
            StyleRank::A => "A",
            StyleRank::S => "S",
            StyleRank::SS => "SS",
            StyleRank::SSS => "SSS",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        RANK_TABLE
            .iter()
            .map(|row| row.rank)
            .find(|rank| rank.label().eq_ignore_ascii_case(label.trim()))
    }

    /// Position in the table, D = 0.
    pub fn ordinal(self) -> i64 {
        self as i64
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| RANK_TABLE.get(idx))
            .map(|row| row.rank)
    }

    pub fn title(self) -> &'static str {
        self.row().title
    }

    pub fn multiplier(self) -> Decimal {
        Decimal::new(self.row().multiplier_tenths, 1)
    }

    pub fn color(self) -> u32 {
        self.row().color
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CombatEntry {
    Kill {
        at: DateTime<Utc>,
        weapon: Option<String>,
    },
    Death {
        at: DateTime<Utc>,
    },
}

/// Decaying style meter. `value` is the reading at `anchor` (the last kill);
/// readings at later instants apply idle decay on the fly.
#[derive(Debug, Clone, Default)]
pub struct StyleMeter {
    value: f64,
    anchor: Option<DateTime<Utc>>,
    recent_weapons: VecDeque<Option<String>>,
}

impl StyleMeter {
    pub fn value_at(&self, now: DateTime<Utc>, config: &StyleConfig) -> f64 {
        let Some(anchor) = self.anchor else {
            return self.value;
        };
        let elapsed = seconds_between(anchor, now);
        let idle = elapsed - config.idle_secs;
        if idle <= 0.0 {
            return self.value;
        }
        (self.value - idle * config.decay_per_sec).max(0.0)
    }

    pub fn rank_at(&self, now: DateTime<Utc>, config: &StyleConfig) -> StyleRank {
        StyleRank::from_meter(self.value_at(now, config))
    }

    /// Returns the points the kill added.
    pub fn record_kill(&mut self, at: DateTime<Utc>, weapon: Option<&str>, config: &StyleConfig) -> f64 {
        let current = self.value_at(at, config);
        let mut points = config.kill_points;
        if self.is_variety_kill(weapon) {
            points *= 1.0 + config.variety_bonus;
        }
        self.value = (current + points).clamp(0.0, config.meter_max);
        self.anchor = Some(match self.anchor {
            Some(previous) if previous > at => previous,
            _ => at,
        });
        self.recent_weapons.push_back(weapon.map(ToOwned::to_owned));
        while self.recent_weapons.len() > 2 {
            self.recent_weapons.pop_front();
        }
        points
    }

    pub fn record_death(&mut self) {
        self.value = 0.0;
        self.anchor = None;
        self.recent_weapons.clear();
    }

    fn is_variety_kill(&self, weapon: Option<&str>) -> bool {
        let Some(weapon) = weapon else {
            return false;
        };
        !self.recent_weapons.is_empty()
            && self
                .recent_weapons
                .iter()
                .all(|previous| previous.as_deref() != Some(weapon))
    }
}

/// Folds a combat history into the rank and multiplier in effect at `now`.
pub fn compute_rank(
    history: &[CombatEntry],
    now: DateTime<Utc>,
    config: &StyleConfig,
) -> (StyleRank, Decimal) {
    let mut meter = StyleMeter::default();
    for entry in history {
        match entry {
            CombatEntry::Kill { at, weapon } => {
                meter.record_kill(*at, weapon.as_deref(), config);
            }
            CombatEntry::Death { .. } => meter.record_death(),
        }
    }
    let rank = meter.rank_at(now, config);
    (rank, rank.multiplier())
}

pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}
