use rust_decimal::Decimal;
use serde::Serialize;

use crate::{amount::Amount, combo::ComboTier, config::RewardConfig, events::EventKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bonus {
    pub label: String,
    pub amount: Decimal,
}

impl Bonus {
    fn new(label: &str, amount: Decimal) -> Self {
        Self {
            label: label.to_owned(),
            amount,
        }
    }
}

/// What the pipeline knows about a kill when pricing it.
#[derive(Debug, Clone, Default)]
pub struct KillContext<'a> {
    pub target: &'a str,
    pub first_blood: bool,
    pub headshot: bool,
    pub melee: bool,
    pub midair: bool,
    pub distance: Option<f32>,
    pub revenge: bool,
    pub kills_on_target: u32,
    pub killstreak: u32,
}

#[derive(Debug, Clone)]
pub struct RewardPolicy {
    config: RewardConfig,
}

impl RewardPolicy {
    pub fn new(config: &RewardConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn base_reward(&self, kind: EventKind) -> Decimal {
        match kind {
            EventKind::Kill => self.config.kill,
            EventKind::MatchEnd => self.config.match_win,
            EventKind::Death | EventKind::CustomBonus => Decimal::ZERO,
        }
    }

    pub fn kill_bonuses(&self, ctx: &KillContext<'_>) -> Vec<Bonus> {
        let cfg = &self.config;
        let mut bonuses = Vec::new();
        if ctx.first_blood {
            bonuses.push(Bonus::new("FIRST BLOOD", cfg.first_blood));
        }
        if ctx.headshot {
            bonuses.push(Bonus::new("HEADSHOT", cfg.headshot));
        }
        if ctx.midair {
            bonuses.push(Bonus::new("MIDAIR", cfg.midair));
        }
        if ctx.melee {
            bonuses.push(Bonus::new("EXECUTION", cfg.melee));
        }
        if cfg
            .boss_names
            .iter()
            .any(|boss| !boss.is_empty() && ctx.target.contains(boss.as_str()))
        {
            bonuses.push(Bonus::new("BOSS SLAIN", cfg.boss_kill));
        }
        if ctx.revenge {
            bonuses.push(Bonus::new("REVENGE", cfg.revenge));
        }
        if ctx.kills_on_target == cfg.domination_kills {
            bonuses.push(Bonus::new("DOMINATION", cfg.domination));
        }
        if ctx
            .distance
            .is_some_and(|distance| distance >= cfg.longshot_distance)
        {
            bonuses.push(Bonus::new("LONGSHOT", cfg.longshot));
        }
        if let Some(milestone) = cfg
            .streak_milestones
            .iter()
            .find(|milestone| milestone.kills == ctx.killstreak)
        {
            bonuses.push(Bonus::new(&milestone.name, milestone.amount));
        }
        bonuses.retain(|bonus| bonus.amount > Decimal::ZERO);
        bonuses
    }

    pub fn combo_fraction(&self, tier: ComboTier) -> Decimal {
        let fractions = &self.config.combo_fractions;
        match tier {
            ComboTier::None => Decimal::ZERO,
            ComboTier::Double => fractions.double,
            ComboTier::Triple => fractions.triple,
            ComboTier::Ultra => fractions.ultra,
            ComboTier::Godlike => fractions.godlike,
        }
    }

    /// base(kind) * rank multiplier * (1 + combo fraction) + flat bonuses
    pub fn event_amount(
        &self,
        kind: EventKind,
        multiplier: Decimal,
        tier: ComboTier,
        bonuses: &[Bonus],
    ) -> Amount {
        let scaled =
            self.base_reward(kind) * multiplier * (Decimal::ONE + self.combo_fraction(tier));
        let flat: Decimal = bonuses.iter().map(|bonus| bonus.amount).sum();
        Amount::from_decimal(scaled + flat)
    }

    /// Credited once per tier crossing, on top of the kill itself.
    pub fn combo_bonus(&self, kills: u32, multiplier: Decimal) -> Amount {
        Amount::from_decimal(self.config.combo_bonus_per_kill * Decimal::from(kills) * multiplier)
    }

    pub fn custom_bonus_amount(&self, requested: Decimal) -> Amount {
        Amount::from_decimal(requested.max(Decimal::ZERO).min(self.config.custom_bonus_cap))
    }
}
