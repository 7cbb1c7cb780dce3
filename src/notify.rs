use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    amount::Amount, combo::ComboTier, config::WebhookConfig, error::SinkError, rank::StyleRank,
    registry::Standing,
};

const NOTABLE_AMOUNT_UNITS: i64 = 5_000;
const DEDUPE_MEMORY: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub footer: EmbedFooter,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub embeds: Vec<Embed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardNotice {
    pub event_id: String,
    pub player: String,
    pub detail: String,
    pub amount: Amount,
    pub rank: StyleRank,
    pub multiplier: Decimal,
    pub combo: Option<ComboTier>,
    pub bonuses: Vec<String>,
    pub killstreak: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryLine {
    pub standing: Standing,
    pub earned: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Reward(RewardNotice),
    RankChange {
        player: String,
        from: StyleRank,
        to: StyleRank,
        at: DateTime<Utc>,
    },
    MatchSummary {
        winner: Option<String>,
        lines: Vec<SummaryLine>,
        total: Amount,
        at: DateTime<Utc>,
    },
}

impl Notification {
    pub fn dedupe_key(&self) -> String {
        match self {
            Notification::Reward(notice) => notice.event_id.clone(),
            Notification::RankChange { player, to, at, .. } => {
                format!("rank:{player}:{}:{}", to.label(), at.timestamp_millis())
            }
            Notification::MatchSummary { at, .. } => format!("match:{}", at.timestamp_millis()),
        }
    }

    pub fn is_notable(&self, min_rank: StyleRank) -> bool {
        match self {
            Notification::Reward(notice) => {
                !notice.bonuses.is_empty()
                    || notice.combo.is_some()
                    || notice.rank >= min_rank
                    || notice.killstreak >= 5
                    || notice.amount.units() >= NOTABLE_AMOUNT_UNITS
            }
            Notification::RankChange { from, to, .. } => to > from,
            Notification::MatchSummary { .. } => true,
        }
    }

    pub fn to_payload(&self, footer: &str) -> WebhookPayload {
        let embed = match self {
            Notification::Reward(notice) => reward_embed(notice),
            Notification::RankChange {
                player,
                from,
                to,
                at,
            } => Embed {
                title: format!("{} RANK", to.title()),
                description: format!("**{player}** climbed from {} to **{}**", from.label(), to.label()),
                color: to.color(),
                fields: vec![field("Multiplier", format!("{}x", to.multiplier()), true)],
                footer: EmbedFooter {
                    text: String::new(),
                },
                timestamp: format_timestamp(*at),
            },
            Notification::MatchSummary {
                winner,
                lines,
                total,
                at,
            } => match_embed(winner.as_deref(), lines, *total, *at),
        };
        WebhookPayload {
            embeds: vec![Embed {
                footer: EmbedFooter {
                    text: footer.to_owned(),
                },
                ..embed
            }],
            nonce: Some(self.dedupe_key()),
        }
    }
}

fn reward_embed(notice: &RewardNotice) -> Embed {
    let title = match notice.combo {
        Some(tier) => tier.title().to_owned(),
        None if notice.bonuses.iter().any(|b| b == "FIRST BLOOD") => "FIRST BLOOD!".to_owned(),
        None => "Arena Reward".to_owned(),
    };
    let mut description = format!("**{}**: {}", notice.player, notice.detail);
    if !notice.bonuses.is_empty() {
        description.push('\n');
        description.push_str(&notice.bonuses.join(", "));
    }
    let mut fields = vec![
        field("Earned", format!("+{}", notice.amount), true),
        field(
            "Rank",
            format!(
                "{} {} ({}x)",
                notice.rank.label(),
                notice.rank.title(),
                notice.multiplier
            ),
            true,
        ),
    ];
    if notice.killstreak >= 2 {
        fields.push(field("Streak", notice.killstreak.to_string(), true));
    }
    Embed {
        title,
        description,
        color: notice.rank.color(),
        fields,
        footer: EmbedFooter {
            text: String::new(),
        },
        timestamp: format_timestamp(notice.at),
    }
}

fn match_embed(winner: Option<&str>, lines: &[SummaryLine], total: Amount, at: DateTime<Utc>) -> Embed {
    let mut description = String::new();
    if let Some(winner) = winner {
        description.push_str(&format!("Winner: **{winner}**\n"));
    }
    for (idx, line) in lines.iter().take(3).enumerate() {
        description.push_str(&format!(
            "{}. **{}**: {} kills ({})\n",
            idx + 1,
            line.standing.player,
            line.standing.kills,
            line.earned
        ));
    }
    let total_kills: u32 = lines.iter().map(|line| line.standing.kills).sum();
    Embed {
        title: "Match Complete!".to_owned(),
        description: description.trim_end().to_owned(),
        color: 0xFF_D7_00,
        fields: vec![
            field("Total Kills", total_kills.to_string(), true),
            field("Distributed", total.to_string(), true),
        ],
        footer: EmbedFooter {
            text: String::new(),
        },
        timestamp: format_timestamp(at),
    }
}

fn field(name: &str, value: String, inline: bool) -> EmbedField {
    EmbedField {
        name: name.to_owned(),
        value,
        inline,
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub trait Publisher: Send + 'static {
    fn publish(&mut self, payload: &WebhookPayload) -> Result<(), SinkError>;
}

/// Posts to a chat webhook. The blocking client is built on first use so it
/// lives entirely on the notifier thread.
pub struct WebhookPublisher {
    url: String,
    timeout: Duration,
    client: Option<reqwest::blocking::Client>,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            client: None,
        }
    }
}

impl Publisher for WebhookPublisher {
    fn publish(&mut self, payload: &WebhookPayload) -> Result<(), SinkError> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|err| SinkError::Unavailable(format!("http client init failed: {err}")))?;
            self.client = Some(client);
        }
        let Some(client) = self.client.as_ref() else {
            return Err(SinkError::Unavailable("http client missing".to_owned()));
        };
        let response = client
            .post(&self.url)
            .header("User-Agent", "arena-rewards")
            .json(payload)
            .send()
            .map_err(|err| SinkError::Unavailable(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected(response.status().as_u16()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub queue_len: usize,
    pub min_rank: StyleRank,
    pub footer: String,
}

impl NotifierSettings {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            queue_len: config.queue_len.max(1),
            min_rank: config.min_rank,
            footer: config.footer.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct SinkCounters {
    queued: AtomicU64,
    filtered: AtomicU64,
    deduped: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub queued: u64,
    pub filtered: u64,
    pub deduped: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
    pub discarded: u64,
}

impl SinkCounters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            queued: self.queued.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            deduped: self.deduped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Cheap to clone; `publish` never blocks.
#[derive(Clone)]
pub struct NotifierHandle {
    queue: Option<(Sender<Notification>, Receiver<Notification>)>,
    min_rank: StyleRank,
    counters: Arc<SinkCounters>,
}

impl NotifierHandle {
    pub fn disabled() -> Self {
        Self {
            queue: None,
            min_rank: StyleRank::D,
            counters: Arc::new(SinkCounters::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    pub fn publish(&self, notification: Notification) {
        let Some((tx, overflow)) = self.queue.as_ref() else {
            return;
        };
        if !notification.is_notable(self.min_rank) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut pending = notification;
        loop {
            match tx.try_send(pending) {
                Ok(()) => {
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(oldest) = overflow.try_recv() {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %oldest.dedupe_key(), "notification queue full; dropped oldest");
                    }
                    pending = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("notifier stopped; notification discarded");
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }
}

pub struct NotificationSink {
    handle: NotifierHandle,
    deadline_tx: Option<Sender<Instant>>,
    worker: Option<JoinHandle<()>>,
}

impl NotificationSink {
    pub fn from_config(config: &WebhookConfig) -> Self {
        let Some(url) = config
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        else {
            info!("no webhook configured; notifications disabled");
            return Self::disabled();
        };
        let publisher = WebhookPublisher::new(url, Duration::from_millis(config.timeout_ms));
        Self::spawn(publisher, NotifierSettings::from_config(config))
    }

    pub fn disabled() -> Self {
        Self {
            handle: NotifierHandle::disabled(),
            deadline_tx: None,
            worker: None,
        }
    }

    pub fn spawn<P: Publisher>(publisher: P, settings: NotifierSettings) -> Self {
        let (tx, rx) = bounded::<Notification>(settings.queue_len);
        let (deadline_tx, deadline_rx) = bounded::<Instant>(1);
        let counters = Arc::new(SinkCounters::default());
        let handle = NotifierHandle {
            queue: Some((tx, rx.clone())),
            min_rank: settings.min_rank,
            counters: counters.clone(),
        };
        let worker = thread::spawn(move || {
            let mut worker = NotifierWorker {
                publisher,
                settings,
                counters,
                recent_keys: HashSet::new(),
                recent_order: VecDeque::new(),
                deadline: None,
            };
            worker.run(rx, deadline_rx);
        });
        Self {
            handle,
            deadline_tx: Some(deadline_tx),
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> NotifierHandle {
        self.handle.clone()
    }

    /// Lets the worker drain for up to `grace`, then discards what is left.
    pub fn shutdown(mut self, grace: Duration) -> SinkStats {
        if let Some(deadline_tx) = self.deadline_tx.take() {
            let _ = deadline_tx.send(Instant::now() + grace);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("notifier thread panicked");
            }
        }
        let stats = self.handle.stats();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            discarded = stats.discarded,
            "notifier stopped"
        );
        stats
    }
}

struct NotifierWorker<P> {
    publisher: P,
    settings: NotifierSettings,
    counters: Arc<SinkCounters>,
    recent_keys: HashSet<String>,
    recent_order: VecDeque<String>,
    deadline: Option<Instant>,
}

impl<P: Publisher> NotifierWorker<P> {
    fn run(&mut self, rx: Receiver<Notification>, deadline_rx: Receiver<Instant>) {
        loop {
            if self.deadline.is_none() {
                if let Ok(deadline) = deadline_rx.try_recv() {
                    self.deadline = Some(deadline);
                }
            }
            if self.past_deadline() {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(notification) => self.deliver(notification),
                Err(RecvTimeoutError::Timeout) => {
                    if self.deadline.is_some() && rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let leftover = rx.try_iter().count() as u64;
        if leftover > 0 {
            warn!(leftover, "notifier grace period elapsed; discarding queued notifications");
            self.counters.discarded.fetch_add(leftover, Ordering::Relaxed);
        }
    }

    fn past_deadline(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    fn remember(&mut self, key: &str) -> bool {
        if !self.recent_keys.insert(key.to_owned()) {
            return false;
        }
        self.recent_order.push_back(key.to_owned());
        while self.recent_order.len() > DEDUPE_MEMORY {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent_keys.remove(&old);
            }
        }
        true
    }

    fn deliver(&mut self, notification: Notification) {
        let key = notification.dedupe_key();
        if !self.remember(&key) {
            debug!(key = %key, "skipping duplicate notification");
            self.counters.deduped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let payload = notification.to_payload(&self.settings.footer);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publisher.publish(&payload) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    let backoff = self.settings.backoff * 2u32.saturating_pow(attempt - 1);
                    let out_of_time = self
                        .deadline
                        .map(|deadline| Instant::now() + backoff >= deadline)
                        .unwrap_or(false);
                    if !err.is_retryable() || attempt >= self.settings.max_attempts || out_of_time {
                        warn!(%err, key = %key, attempt, "webhook delivery failed; dropping notification");
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    debug!(%err, key = %key, attempt, "webhook delivery failed; retrying");
                    thread::sleep(backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use chrono::{TimeZone, Utc};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use rust_decimal::Decimal;

    use super::{
        Notification, NotificationSink, NotifierSettings, Publisher, RewardNotice, WebhookPayload,
    };
    use crate::{amount::Amount, error::SinkError, rank::StyleRank};

    fn settings(queue_len: usize) -> NotifierSettings {
        NotifierSettings {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            queue_len,
            min_rank: StyleRank::S,
            footer: "RustChain Arena".to_owned(),
        }
    }

    fn rank_up(player: &str, secs: i64) -> Notification {
        Notification::RankChange {
            player: player.to_owned(),
            from: StyleRank::A,
            to: StyleRank::S,
            at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn notice(bonuses: Vec<String>, rank: StyleRank, units: i64) -> RewardNotice {
        RewardNotice {
            event_id: "server.log:1".to_owned(),
            player: "Scott".to_owned(),
            detail: "Scott killed Boris".to_owned(),
            amount: Amount::from_units(units),
            rank,
            multiplier: rank.multiplier(),
            combo: None,
            bonuses,
            killstreak: 1,
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    struct GatedPublisher {
        started: Sender<()>,
        gate: Receiver<()>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Publisher for GatedPublisher {
        fn publish(&mut self, payload: &WebhookPayload) -> Result<(), SinkError> {
            let _ = self.started.try_send(());
            let _ = self.gate.recv();
            let nonce = payload.nonce.clone().unwrap_or_default();
            self.seen.lock().expect("lock should not be poisoned").push(nonce);
            Ok(())
        }
    }

    struct FailingPublisher {
        attempts: Arc<AtomicU32>,
        error: fn() -> SinkError,
    }

    impl Publisher for FailingPublisher {
        fn publish(&mut self, _payload: &WebhookPayload) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (started_tx, started_rx) = bounded::<()>(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = NotificationSink::spawn(
            GatedPublisher {
                started: started_tx,
                gate: gate_rx,
                seen: seen.clone(),
            },
            settings(2),
        );
        let handle = sink.handle();
        handle.publish(rank_up("first", 1));
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker should pick up the first notification");

        handle.publish(rank_up("second", 2));
        handle.publish(rank_up("third", 3));
        handle.publish(rank_up("fourth", 4));
        drop(gate_tx);

        let stats = sink.shutdown(Duration::from_secs(5));
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 3);
        let seen = seen.lock().expect("lock should not be poisoned").clone();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].starts_with("rank:first:"));
        assert!(seen[1].starts_with("rank:third:"));
        assert!(seen[2].starts_with("rank:fourth:"));
    }

    #[test]
    fn unreachable_webhook_gives_up_after_bounded_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let sink = NotificationSink::spawn(
            FailingPublisher {
                attempts: attempts.clone(),
                error: || SinkError::Unavailable("connection refused".to_owned()),
            },
            settings(8),
        );
        sink.handle().publish(rank_up("Scott", 1));
        let stats = sink.shutdown(Duration::from_secs(5));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let sink = NotificationSink::spawn(
            FailingPublisher {
                attempts: attempts.clone(),
                error: || SinkError::Rejected(400),
            },
            settings(8),
        );
        sink.handle().publish(rank_up("Scott", 1));
        let stats = sink.shutdown(Duration::from_secs(5));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn routine_rewards_are_filtered_and_duplicates_skipped() {
        let (started_tx, _started_rx) = bounded::<()>(16);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        drop(gate_tx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = NotificationSink::spawn(
            GatedPublisher {
                started: started_tx,
                gate: gate_rx,
                seen: seen.clone(),
            },
            settings(8),
        );
        let handle = sink.handle();
        handle.publish(Notification::Reward(notice(Vec::new(), StyleRank::C, 1_200)));
        handle.publish(Notification::Reward(notice(
            vec!["HEADSHOT".to_owned()],
            StyleRank::C,
            1_700,
        )));
        handle.publish(Notification::Reward(notice(
            vec!["HEADSHOT".to_owned()],
            StyleRank::C,
            1_700,
        )));
        let stats = sink.shutdown(Duration::from_secs(5));
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.deduped, 1);
    }

    #[test]
    fn disabled_sink_accepts_and_ignores() {
        let sink = NotificationSink::disabled();
        let handle = sink.handle();
        assert!(!handle.is_enabled());
        handle.publish(rank_up("Scott", 1));
        assert_eq!(sink.shutdown(Duration::from_millis(10)).queued, 0);
    }

    #[test]
    fn payload_carries_embed_and_nonce() {
        let notification = Notification::Reward(notice(
            vec!["FIRST BLOOD".to_owned()],
            StyleRank::SS,
            25_000,
        ));
        assert!(notification.is_notable(StyleRank::S));
        let payload = notification.to_payload("RustChain Arena");
        let value = serde_json::to_value(&payload).expect("payload should serialize");
        assert_eq!(value["nonce"], "server.log:1");
        let embed = &value["embeds"][0];
        assert_eq!(embed["title"], "FIRST BLOOD!");
        assert_eq!(embed["color"], 0xFF_00_00);
        assert_eq!(embed["footer"]["text"], "RustChain Arena");
        assert_eq!(embed["fields"][0]["value"], "+0.025000");
        assert_eq!(embed["fields"][1]["value"], format!("SS SLASHING ({}x)", Decimal::new(40, 1)));
        assert_eq!(embed["timestamp"], "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn rank_drops_are_not_notable() {
        let drop = Notification::RankChange {
            player: "Scott".to_owned(),
            from: StyleRank::S,
            to: StyleRank::D,
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        assert!(!drop.is_notable(StyleRank::S));
    }
}
