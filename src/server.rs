use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{
    amount::Amount,
    events::FeedEvent,
    feed::{EventFeed, FeedCounters, FeedStats},
    ledger::{LeaderboardEntry, RewardLedger, RewardRecord},
    notify::{NotifierHandle, SinkStats},
    progression::PlayerProfile,
};

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

#[derive(Clone)]
pub struct ServerState {
    ledger: RewardLedger,
    ingest: Arc<Mutex<EventFeed>>,
    tx: Sender<FeedEvent>,
    feed_counters: Arc<FeedCounters>,
    notifier: NotifierHandle,
    started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        ledger: RewardLedger,
        ingest: EventFeed,
        tx: Sender<FeedEvent>,
        feed_counters: Arc<FeedCounters>,
        notifier: NotifierHandle,
    ) -> Self {
        Self {
            ledger,
            ingest: Arc::new(Mutex::new(ingest)),
            tx,
            feed_counters,
            notifier,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct PlayerTotal {
    pub player: String,
    pub total: Amount,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: i64,
    pub records: u64,
    pub feed: FeedStats,
    pub notifier: SinkStats,
    pub notifier_enabled: bool,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: u64,
    pub ignored: u64,
    pub malformed: u64,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/leaderboard", get(leaderboard))
        .route("/players/:player/total", get(player_total))
        .route("/players/:player/recent", get(player_recent))
        .route("/players/:player/profile", get(player_profile))
        .route("/ingest", post(ingest))
        .with_state(state)
}

pub async fn serve(bind: &str, state: ServerState) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid http bind address: {bind}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed binding http listener on {addr}"))?;
    info!("query api listening on http://{addr}");
    info!("http ingest available at http://{addr}/ingest");
    axum::serve(listener, router(state))
        .await
        .context("axum serve failed")?;
    Ok(())
}

async fn with_ledger<T, F>(ledger: &RewardLedger, query: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(RewardLedger) -> Result<T, crate::error::LedgerError> + Send + 'static,
{
    let ledger = ledger.clone();
    tokio::task::spawn_blocking(move || query(ledger))
        .await
        .map_err(|err| ApiError::internal(format!("ledger task failed: {err}")))?
        .map_err(|err| {
            error!(%err, "ledger query failed");
            ApiError::internal(err.to_string())
        })
}

async fn health(State(state): State<ServerState>) -> Result<Json<HealthReport>, ApiError> {
    let records = with_ledger(&state.ledger, |ledger| ledger.record_count()).await?;
    Ok(Json(HealthReport {
        status: "ok",
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        records,
        feed: state.feed_counters.snapshot(),
        notifier: state.notifier.stats(),
        notifier_enabled: state.notifier.is_enabled(),
    }))
}

async fn player_total(
    State(state): State<ServerState>,
    Path(player): Path<String>,
) -> Result<Json<PlayerTotal>, ApiError> {
    let lookup = player.clone();
    let total = with_ledger(&state.ledger, move |ledger| ledger.total_for(&lookup)).await?;
    Ok(Json(PlayerTotal { player, total }))
}

async fn player_recent(
    State(state): State<ServerState>,
    Path(player): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RewardRecord>>, ApiError> {
    let limit = query.resolve();
    let records =
        with_ledger(&state.ledger, move |ledger| ledger.recent_records(&player, limit)).await?;
    Ok(Json(records))
}

async fn player_profile(
    State(state): State<ServerState>,
    Path(player): Path<String>,
) -> Result<Json<PlayerProfile>, ApiError> {
    let profile = with_ledger(&state.ledger, move |ledger| ledger.profile(&player)).await?;
    Ok(Json(profile))
}

async fn leaderboard(
    State(state): State<ServerState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let limit = query.resolve();
    let entries = with_ledger(&state.ledger, move |ledger| ledger.leaderboard(limit)).await?;
    Ok(Json(entries))
}

/// Accepts newline-separated records in the same grammar as the log.
async fn ingest(State(state): State<ServerState>, body: String) -> Result<(StatusCode, Json<IngestReport>), ApiError> {
    let mut feed = state
        .ingest
        .lock()
        .map_err(|_| ApiError::internal("ingest feed lock poisoned"))?;
    let before = feed.stats();
    let mut report = IngestReport::default();
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        let Some(event) = feed.push_line(line, Utc::now()) else {
            continue;
        };
        if state.tx.send(event).is_err() {
            warn!("event consumer dropped; rejecting ingest");
            return Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "event consumer is not running",
            ));
        }
        report.accepted += 1;
    }
    let after = feed.stats();
    report.ignored = after.ignored - before.ignored;
    report.malformed = after.malformed - before.malformed;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf, sync::Arc, time::SystemTime};

    use axum::{
        extract::{Path, Query, State},
        http::StatusCode,
    };
    use chrono::{TimeZone, Utc};
    use crossbeam_channel::unbounded;

    use super::{
        health, ingest, leaderboard, player_profile, player_recent, player_total, LimitQuery,
        ServerState,
    };
    use crate::{
        amount::Amount,
        feed::{EventFeed, FeedCounters},
        ledger::{Checkpoint, EventCommit, LedgerStore, NewRecord, RewardLedger, StatDelta},
        notify::NotifierHandle,
        rank::StyleRank,
    };

    fn temp_ledger(tag: &str) -> (RewardLedger, PathBuf) {
        let unique = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("arena_server_{tag}_{unique}.db"));
        let ledger = RewardLedger::open(path.clone()).expect("ledger should open");
        (ledger, path)
    }

    fn cleanup(path: &PathBuf) {
        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = path.clone().into_os_string();
            candidate.push(suffix);
            fs::remove_file(PathBuf::from(candidate)).ok();
        }
    }

    fn seed(ledger: &RewardLedger, event_id: &str, player: &str, units: i64) {
        ledger
            .credit(&NewRecord {
                event_id: event_id.to_owned(),
                player: player.to_owned(),
                wallet: format!("arena-{}", player.to_lowercase()),
                amount: Amount::from_units(units),
                source: "kill".to_owned(),
                rank: None,
                multiplier: None,
                combo: None,
                at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            })
            .expect("seed credit should land");
    }

    #[tokio::test]
    async fn query_endpoints_read_the_ledger() {
        let (ledger, path) = temp_ledger("queries");
        seed(&ledger, "a:1", "Scott", 1_200);
        seed(&ledger, "a:2", "Scott", 3_000);
        seed(&ledger, "a:3", "Boris", 1_000);
        let (tx, _rx) = unbounded();
        let state = ServerState::new(
            ledger,
            EventFeed::continuing("ingest", None),
            tx,
            Arc::new(FeedCounters::default()),
            NotifierHandle::disabled(),
        );

        let total = player_total(State(state.clone()), Path("Scott".to_owned()))
            .await
            .expect("total should resolve");
        assert_eq!(total.0.total.units(), 4_200);

        let recent = player_recent(
            State(state.clone()),
            Path("Scott".to_owned()),
            Query(LimitQuery { limit: Some(1) }),
        )
        .await
        .expect("recent should resolve");
        assert_eq!(recent.0.len(), 1);
        assert_eq!(recent.0[0].event_id, "a:2");

        let board = leaderboard(State(state.clone()), Query(LimitQuery { limit: None }))
            .await
            .expect("leaderboard should resolve");
        assert_eq!(board.0[0].player, "Scott");
        assert_eq!(board.0.len(), 2);

        let health = health(State(state)).await.expect("health should resolve");
        assert_eq!(health.0.records, 3);
        assert!(!health.0.notifier_enabled);
        cleanup(&path);
    }

    #[tokio::test]
    async fn profile_endpoint_combines_totals_and_lifetime_stats() {
        let (ledger, path) = temp_ledger("profile");
        seed(&ledger, "a:1", "Scott", 150_000);
        let mut streak = StatDelta::new("Scott");
        streak.kills = 7;
        streak.deaths = 2;
        streak.streak = 7;
        streak.rank = Some(StyleRank::SS);
        ledger
            .commit_event(&EventCommit {
                stats: &[streak],
                checkpoint: Some(Checkpoint {
                    source: "ingest",
                    seq: 1,
                    position: None,
                }),
                ..EventCommit::default()
            })
            .expect("stats should land");
        let (tx, _rx) = unbounded();
        let state = ServerState::new(
            ledger,
            EventFeed::continuing("ingest", None),
            tx,
            Arc::new(FeedCounters::default()),
            NotifierHandle::disabled(),
        );

        let profile = player_profile(State(state.clone()), Path("Scott".to_owned()))
            .await
            .expect("profile should resolve");
        assert_eq!(profile.0.total.units(), 150_000);
        assert_eq!(profile.0.stats.best_streak, 7);
        assert_eq!(profile.0.stats.highest_rank, Some(StyleRank::SS));
        assert_eq!(profile.0.kd, 3.5);
        assert_eq!(profile.0.progression.title, "Miner");

        let body = serde_json::to_value(&profile.0).expect("profile should serialize");
        assert_eq!(body["progression"]["next"]["title"], "Node Runner");
        assert_eq!(body["total"], "0.150000");

        let stranger = player_profile(State(state), Path("Nobody".to_owned()))
            .await
            .expect("unknown players still resolve");
        assert_eq!(stranger.0.records, 0);
        assert_eq!(stranger.0.progression.level, 1);
        cleanup(&path);
    }

    #[tokio::test]
    async fn ingest_forwards_events_and_counts_the_rest() {
        let (ledger, path) = temp_ledger("ingest");
        let (tx, rx) = unbounded();
        let counters = Arc::new(FeedCounters::default());
        let state = ServerState::new(
            ledger,
            EventFeed::continuing("ingest", Some(9)).with_counters(counters.clone()),
            tx,
            counters.clone(),
            NotifierHandle::disabled(),
        );
        let body = "Scott fragged Boris\nserver: warmup\n{broken\nBoris died\n".to_owned();
        let (status, report) = ingest(State(state.clone()), body)
            .await
            .expect("ingest should accept");
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(report.0.accepted, 2);
        assert_eq!(report.0.ignored, 1);
        assert_eq!(report.0.malformed, 1);
        let ids: Vec<String> = rx.try_iter().map(|event| event.id).collect();
        assert_eq!(ids, vec!["ingest:10", "ingest:13"]);
        assert_eq!(counters.snapshot().parsed, 2);

        drop(rx);
        let err = ingest(State(state), "Scott fragged Boris".to_owned())
            .await
            .expect_err("closed consumer should reject");
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        cleanup(&path);
    }
}
