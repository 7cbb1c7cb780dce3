use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{config::ComboConfig, rank::seconds_between};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboTier {
    None,
    Double,
    Triple,
    Ultra,
    Godlike,
}

impl ComboTier {
    pub fn for_kills(kills: u32) -> Self {
        match kills {
            0 | 1 => ComboTier::None,
            2 => ComboTier::Double,
            3 => ComboTier::Triple,
            4 => ComboTier::Ultra,
            _ => ComboTier::Godlike,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComboTier::None => "none",
            ComboTier::Double => "double",
            ComboTier::Triple => "triple",
            ComboTier::Ultra => "ultra",
            ComboTier::Godlike => "godlike",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ComboTier::None => "",
            ComboTier::Double => "DOUBLE KILL",
            ComboTier::Triple => "TRIPLE KILL",
            ComboTier::Ultra => "ULTRA KILL",
            ComboTier::Godlike => "GODLIKE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(ComboTier::None),
            "double" => Some(ComboTier::Double),
            "triple" => Some(ComboTier::Triple),
            "ultra" => Some(ComboTier::Ultra),
            "godlike" => Some(ComboTier::Godlike),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum ComboState {
    #[default]
    Idle,
    Chain {
        kills: u32,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComboOutcome {
    pub kills: u32,
    pub tier: ComboTier,
    /// Set only on the kill that first reaches a tier within the chain.
    pub crossed: Option<ComboTier>,
}

#[derive(Debug, Clone)]
pub struct ComboDetector {
    windows_secs: Vec<f64>,
}

impl ComboDetector {
    pub fn new(config: &ComboConfig) -> Self {
        let windows_secs = if config.windows_secs.is_empty() {
            ComboConfig::default().windows_secs
        } else {
            config.windows_secs.clone()
        };
        Self { windows_secs }
    }

    /// Seconds from chain start within which the kill after the `kills`-th must land.
    pub fn window_for(&self, kills: u32) -> f64 {
        let idx = (kills.max(1) as usize - 1).min(self.windows_secs.len() - 1);
        self.windows_secs[idx]
    }

    pub fn register_kill(&self, state: &mut ComboState, at: DateTime<Utc>) -> ComboOutcome {
        let (kills, started_at) = match *state {
            ComboState::Chain { kills, started_at }
                if seconds_between(started_at, at) <= self.window_for(kills) =>
            {
                (kills.saturating_add(1), started_at)
            }
            _ => (1, at),
        };
        *state = ComboState::Chain { kills, started_at };

        let tier = ComboTier::for_kills(kills);
        let crossed = (2..=5).contains(&kills).then_some(tier);
        ComboOutcome {
            kills,
            tier,
            crossed,
        }
    }

    pub fn register_death(&self, state: &mut ComboState) {
        *state = ComboState::Idle;
    }
}
