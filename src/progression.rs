use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::{amount::Amount, rank::StyleRank};

struct Tier {
    title: &'static str,
    units: i64,
}

/// Lifetime ladder by total credited, 0.01 token steps growing tenfold.
const LADDER: [Tier; 8] = [
    Tier {
        title: "Unranked",
        units: 0,
    },
    Tier {
        title: "Recruit",
        units: 10_000,
    },
    Tier {
        title: "Miner",
        units: 100_000,
    },
    Tier {
        title: "Node Runner",
        units: 1_000_000,
    },
    Tier {
        title: "Validator",
        units: 10_000_000,
    },
    Tier {
        title: "Block Producer",
        units: 100_000_000,
    },
    Tier {
        title: "Chain Master",
        units: 1_000_000_000,
    },
    Tier {
        title: "Genesis Elite",
        units: 10_000_000_000,
    },
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextTier {
    pub title: &'static str,
    pub threshold: Amount,
    pub needed: Amount,
    /// Share of the next threshold already earned, one decimal place.
    pub progress_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progression {
    /// 1-based step on the ladder.
    pub level: usize,
    pub title: &'static str,
    pub next: Option<NextTier>,
}

impl Progression {
    pub fn for_total(total: Amount) -> Self {
        let level = LADDER
            .iter()
            .rposition(|tier| total.units() >= tier.units)
            .unwrap_or(0);
        let next = LADDER.get(level + 1).map(|tier| {
            let threshold = Amount::from_units(tier.units);
            let progress = (total.to_decimal() / threshold.to_decimal() * Decimal::ONE_HUNDRED)
                .max(Decimal::ZERO)
                .round_dp_with_strategy(1, RoundingStrategy::ToZero);
            NextTier {
                title: tier.title,
                threshold,
                needed: Amount::from_units(tier.units - total.units().max(0)),
                progress_pct: progress,
            }
        });
        Self {
            level: level + 1,
            title: LADDER[level].title,
            next,
        }
    }
}

/// Lifetime counters kept beside the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifetimeStats {
    pub kills: u64,
    pub deaths: u64,
    pub wins: u64,
    pub best_streak: u32,
    pub highest_rank: Option<StyleRank>,
    pub sss_count: u64,
}

impl LifetimeStats {
    pub fn kd(&self) -> f64 {
        self.kills as f64 / self.deaths.max(1) as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerProfile {
    pub player: String,
    pub total: Amount,
    pub records: u64,
    pub kd: f64,
    pub stats: LifetimeStats,
    pub progression: Progression,
}

impl PlayerProfile {
    pub fn new(player: &str, total: Amount, records: u64, stats: LifetimeStats) -> Self {
        Self {
            player: player.to_owned(),
            total,
            records,
            kd: (stats.kd() * 100.0).round() / 100.0,
            progression: Progression::for_total(total),
            stats,
        }
    }
}
