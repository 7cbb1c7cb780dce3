use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::Receiver;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::{
    amount::Amount,
    combo::{ComboDetector, ComboTier},
    config::BridgeConfig,
    error::LedgerError,
    events::{FeedEvent, GameEvent},
    ledger::{Checkpoint, CreditOutcome, EventCommit, LedgerStore, NewRecord, RewardRecord, StatDelta},
    notify::{Notification, NotifierHandle, RewardNotice, SummaryLine},
    policy::{KillContext, RewardPolicy},
    rank::StyleRank,
    registry::PlayerRegistry,
};

const EVICT_EVERY: u64 = 256;
const RECENT_IDS: usize = 4_096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub events: u64,
    pub credited: u64,
    pub duplicates: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessReport {
    pub credited: Vec<RewardRecord>,
    pub duplicates: usize,
}

struct Planned {
    records: Vec<NewRecord>,
    notices: HashMap<String, RewardNotice>,
    extra: Vec<Notification>,
    stats: Vec<StatDelta>,
}

impl Planned {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            notices: HashMap::new(),
            extra: Vec::new(),
            stats: Vec::new(),
        }
    }

    fn push(&mut self, record: NewRecord, notice: RewardNotice) {
        if record.amount.is_zero() {
            return;
        }
        self.notices.insert(record.event_id.clone(), notice);
        self.records.push(record);
    }
}

/// Single writer: applies events in feed order, commits credits and the
/// feed checkpoint together, then hands notifications to the sink.
pub struct RewardPipeline<L: LedgerStore> {
    ledger: L,
    config: BridgeConfig,
    registry: PlayerRegistry,
    combos: ComboDetector,
    policy: RewardPolicy,
    notifier: NotifierHandle,
    first_blood_claimed: bool,
    match_earnings: HashMap<String, Amount>,
    recent_ids: HashSet<String>,
    recent_order: VecDeque<String>,
    clock: Option<DateTime<Utc>>,
    stats: PipelineStats,
}

impl<L: LedgerStore> RewardPipeline<L> {
    pub fn new(ledger: L, config: &BridgeConfig, notifier: NotifierHandle) -> Self {
        Self {
            ledger,
            config: config.clone(),
            registry: PlayerRegistry::new(),
            combos: ComboDetector::new(&config.combo),
            policy: RewardPolicy::new(&config.rewards),
            notifier,
            first_blood_claimed: false,
            match_earnings: HashMap::new(),
            recent_ids: HashSet::new(),
            recent_order: VecDeque::new(),
            clock: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    pub fn process(&mut self, event: &FeedEvent) -> Result<ProcessReport, LedgerError> {
        self.stats.events += 1;
        if self.recent_ids.contains(&event.id) {
            debug!(event_id = %event.id, "event already applied in this session");
            self.stats.duplicates += 1;
            return Ok(ProcessReport {
                credited: Vec::new(),
                duplicates: 1,
            });
        }

        let at = event.event.at();
        self.clock = Some(self.clock.map_or(at, |clock| clock.max(at)));
        let planned = match &event.event {
            GameEvent::Kill {
                actor,
                target,
                weapon,
                headshot,
                melee,
                midair,
                distance,
                at,
            } => self.plan_kill(
                event,
                actor,
                target,
                weapon.as_deref(),
                KillFlags {
                    headshot: *headshot,
                    melee: *melee,
                    midair: *midair,
                    distance: *distance,
                },
                *at,
            ),
            GameEvent::Death { actor, killer, at } => {
                let mut planned = Planned::empty();
                planned.stats.push(self.apply_death(actor, killer.as_deref(), *at));
                planned
            }
            GameEvent::MatchEnd { winner, at } => self.plan_match_end(event, winner.as_deref(), *at),
            GameEvent::CustomBonus {
                actor,
                amount,
                reason,
                at,
            } => self.plan_custom_bonus(event, actor, *amount, reason.as_deref(), *at),
        };

        let outcomes = self.ledger.commit_event(&EventCommit {
            records: &planned.records,
            stats: &planned.stats,
            checkpoint: Some(Checkpoint {
                source: &event.source,
                seq: event.seq,
                position: event.position.as_ref(),
            }),
        })?;
        self.remember(&event.id);

        let mut report = ProcessReport::default();
        let mut notices = planned.notices;
        for outcome in outcomes {
            match outcome {
                CreditOutcome::Credited(record) => {
                    info!(
                        event_id = %record.event_id,
                        player = %record.player,
                        amount = %record.amount,
                        source = %record.source,
                        "credited reward"
                    );
                    let earned = self.match_earnings.entry(record.player.clone()).or_default();
                    *earned = *earned + record.amount;
                    if let Some(notice) = notices.remove(&record.event_id) {
                        self.notifier.publish(Notification::Reward(notice));
                    }
                    report.credited.push(record);
                }
                CreditOutcome::Duplicate(event_id) => {
                    debug!(event_id = %event_id, "skipping already credited event");
                    report.duplicates += 1;
                }
            }
        }
        self.stats.credited += report.credited.len() as u64;
        self.stats.duplicates += report.duplicates as u64;
        if report.duplicates == 0 {
            for notification in planned.extra {
                self.notifier.publish(notification);
            }
        }

        if let GameEvent::MatchEnd { winner, at } = &event.event {
            self.finish_match(winner.clone(), *at, report.duplicates == 0);
        }
        if self.stats.events % EVICT_EVERY == 0 {
            self.evict_idle();
        }
        Ok(report)
    }

    fn plan_kill(
        &mut self,
        event: &FeedEvent,
        actor: &str,
        target: &str,
        weapon: Option<&str>,
        flags: KillFlags,
        at: DateTime<Utc>,
    ) -> Planned {
        let victim = self.apply_death(target, Some(actor), at);

        let style = &self.config.style;
        let player = self.registry.get_or_create(actor, at);
        let rank_before = player.meter.rank_at(at, style);
        player.meter.record_kill(at, weapon, style);
        let rank = player.meter.rank_at(at, style);
        let multiplier = rank.multiplier();
        let combo = self.combos.register_kill(&mut player.combo, at);

        player.kills += 1;
        player.killstreak += 1;
        player.best_streak = player.best_streak.max(player.killstreak);
        let revenge = player.last_killer.as_deref() == Some(target);
        if revenge {
            player.last_killer = None;
        }
        let kills_on_target = player.record_victim(target);
        let killstreak = player.killstreak;

        let first_blood = !self.first_blood_claimed;
        self.first_blood_claimed = true;
        let bonuses = self.policy.kill_bonuses(&KillContext {
            target,
            first_blood,
            headshot: flags.headshot,
            melee: flags.melee,
            midair: flags.midair,
            distance: flags.distance,
            revenge,
            kills_on_target,
            killstreak,
        });
        let amount = self
            .policy
            .event_amount(event.event.kind(), multiplier, combo.tier, &bonuses);
        let wallet = self.config.wallet_for(actor);
        let tier = (combo.tier != ComboTier::None).then_some(combo.tier);

        let mut planned = Planned::empty();
        planned.stats.push(StatDelta {
            kills: 1,
            streak: killstreak,
            rank: Some(rank),
            sss_reached: rank == StyleRank::SSS && rank_before != StyleRank::SSS,
            ..StatDelta::new(actor)
        });
        planned.stats.push(victim);
        planned.push(
            NewRecord {
                event_id: event.id.clone(),
                player: actor.to_owned(),
                wallet: wallet.clone(),
                amount,
                source: "kill".to_owned(),
                rank: Some(rank),
                multiplier: Some(multiplier),
                combo: tier,
                at,
            },
            RewardNotice {
                event_id: event.id.clone(),
                player: actor.to_owned(),
                detail: event.event.label(),
                amount,
                rank,
                multiplier,
                combo: combo.crossed,
                bonuses: bonuses.iter().map(|bonus| bonus.label.clone()).collect(),
                killstreak,
                at,
            },
        );

        if let Some(crossed) = combo.crossed {
            let combo_id = format!("{}#combo-{}", event.id, crossed.as_str());
            let combo_amount = self.policy.combo_bonus(combo.kills, multiplier);
            planned.push(
                NewRecord {
                    event_id: combo_id.clone(),
                    player: actor.to_owned(),
                    wallet,
                    amount: combo_amount,
                    source: format!("combo_{}", crossed.as_str()),
                    rank: Some(rank),
                    multiplier: Some(multiplier),
                    combo: Some(crossed),
                    at,
                },
                RewardNotice {
                    event_id: combo_id,
                    player: actor.to_owned(),
                    detail: format!("{} kills in a row", combo.kills),
                    amount: combo_amount,
                    rank,
                    multiplier,
                    combo: Some(crossed),
                    bonuses: Vec::new(),
                    killstreak,
                    at,
                },
            );
        }

        if rank != rank_before {
            planned.extra.push(Notification::RankChange {
                player: actor.to_owned(),
                from: rank_before,
                to: rank,
                at,
            });
        }
        planned
    }

    fn apply_death(&mut self, actor: &str, killer: Option<&str>, at: DateTime<Utc>) -> StatDelta {
        let player = self.registry.get_or_create(actor, at);
        player.meter.record_death();
        self.combos.register_death(&mut player.combo);
        player.killstreak = 0;
        player.deaths += 1;
        if let Some(killer) = killer {
            player.last_killer = Some(killer.to_owned());
        }
        StatDelta {
            deaths: 1,
            ..StatDelta::new(actor)
        }
    }

    fn plan_match_end(&mut self, event: &FeedEvent, winner: Option<&str>, at: DateTime<Utc>) -> Planned {
        let mut planned = Planned::empty();
        let Some(winner) = winner else {
            return planned;
        };
        let player = self.registry.get_or_create(winner, at);
        let rank = player.meter.rank_at(at, &self.config.style);
        let multiplier = rank.multiplier();
        let amount = self
            .policy
            .event_amount(event.event.kind(), multiplier, ComboTier::None, &[]);
        planned.stats.push(StatDelta {
            wins: 1,
            ..StatDelta::new(winner)
        });
        planned.push(
            NewRecord {
                event_id: event.id.clone(),
                player: winner.to_owned(),
                wallet: self.config.wallet_for(winner),
                amount,
                source: "match_win".to_owned(),
                rank: Some(rank),
                multiplier: Some(multiplier),
                combo: None,
                at,
            },
            RewardNotice {
                event_id: event.id.clone(),
                player: winner.to_owned(),
                detail: event.event.label(),
                amount,
                rank,
                multiplier,
                combo: None,
                bonuses: vec!["MATCH WIN".to_owned()],
                killstreak: 0,
                at,
            },
        );
        planned
    }

    fn plan_custom_bonus(
        &mut self,
        event: &FeedEvent,
        actor: &str,
        requested: Decimal,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Planned {
        let player = self.registry.get_or_create(actor, at);
        let rank = player.meter.rank_at(at, &self.config.style);
        let amount = self.policy.custom_bonus_amount(requested);
        let mut planned = Planned::empty();
        planned.push(
            NewRecord {
                event_id: event.id.clone(),
                player: actor.to_owned(),
                wallet: self.config.wallet_for(actor),
                amount,
                source: "custom_bonus".to_owned(),
                rank: None,
                multiplier: None,
                combo: None,
                at,
            },
            RewardNotice {
                event_id: event.id.clone(),
                player: actor.to_owned(),
                detail: event.event.label(),
                amount,
                rank,
                multiplier: rank.multiplier(),
                combo: None,
                bonuses: vec![reason.unwrap_or("CUSTOM BONUS").to_owned()],
                killstreak: 0,
                at,
            },
        );
        planned
    }

    fn finish_match(&mut self, winner: Option<String>, at: DateTime<Utc>, announce: bool) {
        let lines: Vec<SummaryLine> = self
            .registry
            .standings()
            .into_iter()
            .map(|standing| SummaryLine {
                earned: self
                    .match_earnings
                    .get(&standing.player)
                    .copied()
                    .unwrap_or_default(),
                standing,
            })
            .collect();
        let total: Amount = self.match_earnings.values().copied().sum();
        info!(
            winner = winner.as_deref().unwrap_or("-"),
            players = lines.len(),
            distributed = %total,
            "match complete"
        );
        if announce && (!lines.is_empty() || winner.is_some()) {
            self.notifier.publish(Notification::MatchSummary {
                winner,
                lines,
                total,
                at,
            });
        }
        self.registry.reset_match();
        self.first_blood_claimed = false;
        self.match_earnings.clear();
    }

    fn evict_idle(&mut self) {
        let Some(clock) = self.clock else {
            return;
        };
        let idle_for = Duration::seconds(self.config.player_idle_evict_secs as i64);
        let evicted = self.registry.evict_idle(clock, idle_for);
        if evicted > 0 {
            debug!(evicted, remaining = self.registry.len(), "evicted idle players");
            self.stats.evicted += evicted as u64;
        }
    }

    fn remember(&mut self, event_id: &str) {
        if !self.recent_ids.insert(event_id.to_owned()) {
            return;
        }
        self.recent_order.push_back(event_id.to_owned());
        while self.recent_order.len() > RECENT_IDS {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent_ids.remove(&old);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KillFlags {
    headshot: bool,
    melee: bool,
    midair: bool,
    distance: Option<f32>,
}

/// Drains `rx` until every producer is gone. A storage failure stops the
/// consumer so the checkpoint stays behind the failed event.
pub fn run_consumer<L: LedgerStore>(
    mut pipeline: RewardPipeline<L>,
    rx: Receiver<FeedEvent>,
) -> Result<PipelineStats, LedgerError> {
    for event in rx.iter() {
        if let Err(err) = pipeline.process(&event) {
            error!(%err, event_id = %event.id, source = %event.source, seq = event.seq, "ledger write failed; stopping consumer");
            return Err(err);
        }
    }
    let stats = pipeline.stats();
    info!(
        events = stats.events,
        credited = stats.credited,
        duplicates = stats.duplicates,
        "event consumer drained"
    );
    Ok(stats)
}
