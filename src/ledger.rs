use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::{
    amount::Amount,
    combo::ComboTier,
    config::BridgeConfig,
    error::LedgerError,
    events::LogPosition,
    progression::{LifetimeStats, PlayerProfile},
    rank::StyleRank,
};

#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub event_id: String,
    pub player: String,
    pub wallet: String,
    pub amount: Amount,
    pub source: String,
    pub rank: Option<StyleRank>,
    pub multiplier: Option<Decimal>,
    pub combo: Option<ComboTier>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardRecord {
    pub row_id: i64,
    pub event_id: String,
    pub player: String,
    pub wallet: String,
    pub amount: Amount,
    pub source: String,
    pub rank: Option<StyleRank>,
    pub multiplier: Option<Decimal>,
    pub combo: Option<ComboTier>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub player: String,
    pub total: Amount,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    Credited(RewardRecord),
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint<'a> {
    pub source: &'a str,
    pub seq: u64,
    /// Set for followed log files only.
    pub position: Option<&'a LogPosition>,
}

/// Additive change to one player's lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatDelta {
    pub player: String,
    pub kills: u64,
    pub deaths: u64,
    pub wins: u64,
    pub streak: u32,
    pub rank: Option<StyleRank>,
    pub sss_reached: bool,
}

impl StatDelta {
    pub fn new(player: &str) -> Self {
        Self {
            player: player.to_owned(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventCommit<'a> {
    pub records: &'a [NewRecord],
    pub stats: &'a [StatDelta],
    pub checkpoint: Option<Checkpoint<'a>>,
}

/// Write side used by the pipeline. Records, stat deltas and the feed
/// checkpoint of one event commit together or not at all. Stat deltas are
/// skipped when the checkpoint does not advance or a record was already
/// credited, so a replayed event never counts twice.
pub trait LedgerStore: Send {
    fn commit_event(&self, commit: &EventCommit<'_>) -> Result<Vec<CreditOutcome>, LedgerError>;

    fn checkpoint(&self, source: &str) -> Result<Option<u64>, LedgerError>;
}

#[derive(Debug, Clone)]
pub struct RewardLedger {
    path: PathBuf,
}

impl RewardLedger {
    pub fn open(path: PathBuf) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                LedgerError::Storage(format!(
                    "failed creating ledger dir at {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let ledger = Self { path };
        ledger.init_db()?;
        Ok(ledger)
    }

    pub fn open_from_config(config: &BridgeConfig) -> anyhow::Result<Self> {
        let path = config.ledger_path()?;
        Ok(Self::open(path)?)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection, LedgerError> {
        let conn = Connection::open(&self.path).map_err(|err| {
            LedgerError::Storage(format!(
                "failed opening sqlite db at {}: {err}",
                self.path.display()
            ))
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_db(&self) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS rewards (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    player TEXT NOT NULL,
    wallet TEXT NOT NULL,
    amount INTEGER NOT NULL,
    source TEXT NOT NULL,
    rank TEXT,
    multiplier TEXT,
    combo TEXT,
    at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rewards_player ON rewards(player);
CREATE TRIGGER IF NOT EXISTS rewards_no_update BEFORE UPDATE ON rewards
BEGIN
    SELECT RAISE(ABORT, 'rewards ledger is append-only');
END;
CREATE TRIGGER IF NOT EXISTS rewards_no_delete BEFORE DELETE ON rewards
BEGIN
    SELECT RAISE(ABORT, 'rewards ledger is append-only');
END;
CREATE TABLE IF NOT EXISTS feed_checkpoints (
    source TEXT PRIMARY KEY,
    seq INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS log_positions (
    source TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    byte_offset INTEGER NOT NULL,
    head BLOB NOT NULL,
    anchor BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS player_stats (
    player TEXT PRIMARY KEY,
    kills INTEGER NOT NULL DEFAULT 0,
    deaths INTEGER NOT NULL DEFAULT 0,
    wins INTEGER NOT NULL DEFAULT 0,
    best_streak INTEGER NOT NULL DEFAULT 0,
    highest_rank INTEGER NOT NULL DEFAULT -1,
    sss_count INTEGER NOT NULL DEFAULT 0
);
"#,
        )
        .map_err(|err| LedgerError::Storage(format!("failed creating ledger tables: {err}")))?;
        Ok(())
    }

    /// Appends one record. A second credit for the same event id is rejected
    /// with `LedgerError::Duplicate` and leaves the ledger untouched.
    pub fn credit(&self, record: &NewRecord) -> Result<RewardRecord, LedgerError> {
        let outcome = self
            .commit_event(&EventCommit {
                records: std::slice::from_ref(record),
                ..EventCommit::default()
            })?
            .pop()
            .ok_or_else(|| LedgerError::Storage("credit produced no outcome".to_owned()))?;
        match outcome {
            CreditOutcome::Credited(record) => Ok(record),
            CreditOutcome::Duplicate(event_id) => Err(LedgerError::Duplicate(event_id)),
        }
    }

    pub fn save_checkpoint(&self, source: &str, seq: u64) -> Result<(), LedgerError> {
        self.commit_event(&EventCommit {
            checkpoint: Some(Checkpoint {
                source,
                seq,
                position: None,
            }),
            ..EventCommit::default()
        })?;
        Ok(())
    }

    /// Byte position of the last committed line of a followed log.
    pub fn log_position(&self, source: &str) -> Result<Option<LogPosition>, LedgerError> {
        let conn = self.conn()?;
        let position = conn
            .query_row(
                "SELECT byte_offset, head, anchor FROM log_positions WHERE source = ?1",
                params![source],
                |row| {
                    let offset: i64 = row.get(0)?;
                    let head: Vec<u8> = row.get(1)?;
                    Ok(LogPosition {
                        offset: offset.max(0) as u64,
                        head: Arc::from(head),
                        anchor: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(position)
    }

    pub fn lifetime_stats(&self, player: &str) -> Result<LifetimeStats, LedgerError> {
        let conn = self.conn()?;
        let stats = conn
            .query_row(
                r#"
SELECT kills, deaths, wins, best_streak, highest_rank, sss_count
FROM player_stats
WHERE player = ?1
"#,
                params![player],
                |row| {
                    let count = |idx: usize| row.get::<_, i64>(idx).map(|value| value.max(0) as u64);
                    let best_streak: i64 = row.get(3)?;
                    Ok(LifetimeStats {
                        kills: count(0)?,
                        deaths: count(1)?,
                        wins: count(2)?,
                        best_streak: u32::try_from(best_streak.max(0)).unwrap_or(u32::MAX),
                        highest_rank: StyleRank::from_ordinal(row.get(4)?),
                        sss_count: count(5)?,
                    })
                },
            )
            .optional()?;
        Ok(stats.unwrap_or_default())
    }

    pub fn profile(&self, player: &str) -> Result<PlayerProfile, LedgerError> {
        let conn = self.conn()?;
        let (units, records): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0), COUNT(*) FROM rewards WHERE player = ?1",
            params![player],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let stats = self.lifetime_stats(player)?;
        Ok(PlayerProfile::new(
            player,
            Amount::from_units(units),
            records.max(0) as u64,
            stats,
        ))
    }

    pub fn total_for(&self, player: &str) -> Result<Amount, LedgerError> {
        let conn = self.conn()?;
        let units: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM rewards WHERE player = ?1",
            params![player],
            |row| row.get(0),
        )?;
        Ok(Amount::from_units(units))
    }

    pub fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
SELECT player, SUM(amount) AS total, COUNT(*)
FROM rewards
GROUP BY player
ORDER BY total DESC, player ASC
LIMIT ?1
"#,
        )?;
        let rows = stmt.query_map(params![sql_limit(limit)], |row| {
            let player: String = row.get(0)?;
            let total: i64 = row.get(1)?;
            let records: i64 = row.get(2)?;
            Ok(LeaderboardEntry {
                player,
                total: Amount::from_units(total),
                records: records.max(0) as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Newest first.
    pub fn recent_records(&self, player: &str, limit: usize) -> Result<Vec<RewardRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
SELECT row_id, event_id, player, wallet, amount, source, rank, multiplier, combo, at
FROM rewards
WHERE player = ?1
ORDER BY row_id DESC
LIMIT ?2
"#,
        )?;
        let rows = stmt.query_map(params![player, sql_limit(limit)], decode_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_record(&self, event_id: &str) -> Result<Option<RewardRecord>, LedgerError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                r#"
SELECT row_id, event_id, player, wallet, amount, source, rank, multiplier, combo, at
FROM rewards
WHERE event_id = ?1
"#,
                params![event_id],
                decode_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn record_count(&self) -> Result<u64, LedgerError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM rewards", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl LedgerStore for RewardLedger {
    fn commit_event(&self, commit: &EventCommit<'_>) -> Result<Vec<CreditOutcome>, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let advances = match commit.checkpoint {
            Some(checkpoint) => {
                let stored: Option<i64> = tx
                    .query_row(
                        "SELECT seq FROM feed_checkpoints WHERE source = ?1",
                        params![checkpoint.source],
                        |row| row.get(0),
                    )
                    .optional()?;
                stored.map_or(true, |seq| sql_seq(checkpoint.seq) > seq)
            }
            None => true,
        };

        let mut outcomes = Vec::with_capacity(commit.records.len());
        for record in commit.records {
            let changed = tx.execute(
                r#"
INSERT OR IGNORE INTO rewards (event_id, player, wallet, amount, source, rank, multiplier, combo, at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
                params![
                    record.event_id,
                    record.player,
                    record.wallet,
                    record.amount.units(),
                    record.source,
                    record.rank.map(StyleRank::label),
                    record.multiplier.map(|value| value.to_string()),
                    record.combo.map(ComboTier::as_str),
                    format_timestamp(record.at),
                ],
            )?;
            if changed == 0 {
                debug!(event_id = %record.event_id, "event already credited");
                outcomes.push(CreditOutcome::Duplicate(record.event_id.clone()));
                continue;
            }
            outcomes.push(CreditOutcome::Credited(RewardRecord {
                row_id: tx.last_insert_rowid(),
                event_id: record.event_id.clone(),
                player: record.player.clone(),
                wallet: record.wallet.clone(),
                amount: record.amount,
                source: record.source.clone(),
                rank: record.rank,
                multiplier: record.multiplier,
                combo: record.combo,
                at: record.at,
            }));
        }

        let replayed = outcomes
            .iter()
            .any(|outcome| matches!(outcome, CreditOutcome::Duplicate(_)));
        if advances && !replayed {
            for delta in commit.stats {
                apply_stat_delta(&tx, delta)?;
            }
        } else if !commit.stats.is_empty() {
            debug!(stats = commit.stats.len(), "event already counted; stats unchanged");
        }

        if let Some(checkpoint) = commit.checkpoint {
            tx.execute(
                r#"
INSERT INTO feed_checkpoints (source, seq) VALUES (?1, ?2)
ON CONFLICT(source) DO UPDATE SET seq = max(seq, excluded.seq)
"#,
                params![checkpoint.source, sql_seq(checkpoint.seq)],
            )?;
            if let Some(position) = checkpoint.position {
                tx.execute(
                    r#"
INSERT INTO log_positions (source, seq, byte_offset, head, anchor) VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(source) DO UPDATE SET
    seq = excluded.seq,
    byte_offset = excluded.byte_offset,
    head = excluded.head,
    anchor = excluded.anchor
WHERE excluded.seq >= log_positions.seq
"#,
                    params![
                        checkpoint.source,
                        sql_seq(checkpoint.seq),
                        i64::try_from(position.offset).unwrap_or(i64::MAX),
                        &position.head[..],
                        position.anchor,
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(outcomes)
    }

    fn checkpoint(&self, source: &str) -> Result<Option<u64>, LedgerError> {
        let conn = self.conn()?;
        let seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM feed_checkpoints WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.map(|value| value.max(0) as u64))
    }
}

fn decode_record(row: &Row<'_>) -> rusqlite::Result<RewardRecord> {
    let rank: Option<String> = row.get(6)?;
    let multiplier: Option<String> = row.get(7)?;
    let combo: Option<String> = row.get(8)?;
    let at: String = row.get(9)?;
    Ok(RewardRecord {
        row_id: row.get(0)?,
        event_id: row.get(1)?,
        player: row.get(2)?,
        wallet: row.get(3)?,
        amount: Amount::from_units(row.get(4)?),
        source: row.get(5)?,
        rank: rank.as_deref().and_then(StyleRank::from_label),
        multiplier: multiplier
            .as_deref()
            .and_then(|value| Decimal::from_str(value).ok()),
        combo: combo.as_deref().and_then(ComboTier::parse),
        at: DateTime::parse_from_rfc3339(&at)
            .map(|value| value.with_timezone(&Utc))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
            })?,
    })
}

fn apply_stat_delta(tx: &Transaction<'_>, delta: &StatDelta) -> Result<(), LedgerError> {
    let count = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);
    tx.execute(
        r#"
INSERT INTO player_stats (player, kills, deaths, wins, best_streak, highest_rank, sss_count)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(player) DO UPDATE SET
    kills = kills + excluded.kills,
    deaths = deaths + excluded.deaths,
    wins = wins + excluded.wins,
    best_streak = max(best_streak, excluded.best_streak),
    highest_rank = max(highest_rank, excluded.highest_rank),
    sss_count = sss_count + excluded.sss_count
"#,
        params![
            delta.player,
            count(delta.kills),
            count(delta.deaths),
            count(delta.wins),
            i64::from(delta.streak),
            delta.rank.map_or(-1, StyleRank::ordinal),
            i64::from(delta.sss_reached),
        ],
    )?;
    Ok(())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn sql_seq(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        sync::{Arc, Barrier},
        thread,
        time::SystemTime,
    };

    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;
    use rust_decimal::Decimal;

    use super::{
        Checkpoint, CreditOutcome, EventCommit, LedgerStore, NewRecord, RewardLedger, StatDelta,
    };
    use crate::{
        amount::Amount, combo::ComboTier, error::LedgerError, events::LogPosition,
        progression::LifetimeStats, rank::StyleRank,
    };

    fn temp_ledger(tag: &str) -> (RewardLedger, PathBuf) {
        let unique = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("arena_rewards_{tag}_{unique}.db"));
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

    fn record(event_id: &str, player: &str, units: i64) -> NewRecord {
        NewRecord {
            event_id: event_id.to_owned(),
            player: player.to_owned(),
            wallet: format!("arena-{}", player.to_lowercase()),
            amount: Amount::from_units(units),
            source: "kill".to_owned(),
            rank: Some(StyleRank::C),
            multiplier: Some(Decimal::new(12, 1)),
            combo: None,
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn duplicate_event_id_is_rejected() {
        let (ledger, path) = temp_ledger("dup");
        let first = ledger
            .credit(&record("server.log:7", "Scott", 1_200))
            .expect("first credit should land");
        assert_eq!(first.amount.units(), 1_200);

        let second = ledger.credit(&record("server.log:7", "Scott", 1_200));
        assert!(matches!(second, Err(LedgerError::Duplicate(ref id)) if id == "server.log:7"));
        assert_eq!(ledger.record_count().expect("count should work"), 1);
        assert_eq!(
            ledger.total_for("Scott").expect("total should work").units(),
            1_200
        );
        cleanup(&path);
    }

    #[test]
    fn total_matches_sum_of_records() {
        let (ledger, path) = temp_ledger("sum");
        let units = [1_000, 2_500, 1_875, 5_000];
        for (idx, amount) in units.iter().enumerate() {
            ledger
                .credit(&record(&format!("feed:{idx}"), "Scott", *amount))
                .expect("credit should land");
        }
        ledger
            .credit(&record("feed:99", "Boris", 4_000))
            .expect("credit should land");

        let recent = ledger.recent_records("Scott", 100).expect("recent should work");
        let folded: Amount = recent.iter().map(|r| r.amount).sum();
        assert_eq!(ledger.total_for("Scott").expect("total"), folded);
        assert_eq!(folded.units(), 10_375);
        assert_eq!(recent[0].event_id, "feed:3");
        assert_eq!(recent[0].rank, Some(StyleRank::C));
        assert_eq!(recent[0].multiplier, Some(Decimal::new(12, 1)));

        let board = ledger.leaderboard(10).expect("leaderboard should work");
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].player, "Scott");
        assert_eq!(board[0].records, 4);
        assert_eq!(board[1].total.units(), 4_000);
        assert_eq!(ledger.leaderboard(1).expect("leaderboard").len(), 1);
        assert_eq!(ledger.total_for("Nobody").expect("total").units(), 0);
        cleanup(&path);
    }

    #[test]
    fn rows_cannot_be_rewritten() {
        let (ledger, path) = temp_ledger("append_only");
        ledger
            .credit(&record("feed:1", "Scott", 1_000))
            .expect("credit should land");
        let conn = Connection::open(&path).expect("raw connection should open");
        assert!(conn
            .execute("UPDATE rewards SET amount = 999999", [])
            .is_err());
        assert!(conn.execute("DELETE FROM rewards", []).is_err());
        assert_eq!(ledger.total_for("Scott").expect("total").units(), 1_000);
        cleanup(&path);
    }

    fn at_seq<'a>(source: &'a str, seq: u64) -> Option<Checkpoint<'a>> {
        Some(Checkpoint {
            source,
            seq,
            position: None,
        })
    }

    #[test]
    fn commit_event_is_atomic_with_checkpoint() {
        let (ledger, path) = temp_ledger("commit");
        assert_eq!(ledger.checkpoint("server.log").expect("checkpoint"), None);

        let mut combo = record("server.log:2#combo-double", "Scott", 2_000);
        combo.combo = Some(ComboTier::Double);
        combo.source = "combo_double".to_owned();
        let records = [record("server.log:2", "Scott", 1_100), combo];
        let outcomes = ledger
            .commit_event(&EventCommit {
                records: &records,
                stats: &[],
                checkpoint: at_seq("server.log", 2),
            })
            .expect("commit should land");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome, CreditOutcome::Credited(_))));
        assert_eq!(ledger.checkpoint("server.log").expect("checkpoint"), Some(2));

        let replay = ledger
            .commit_event(&EventCommit {
                records: &records[..1],
                stats: &[],
                checkpoint: at_seq("server.log", 1),
            })
            .expect("replay should be harmless");
        assert!(matches!(replay[0], CreditOutcome::Duplicate(_)));
        assert_eq!(ledger.checkpoint("server.log").expect("checkpoint"), Some(2));

        let stored = ledger
            .find_record("server.log:2#combo-double")
            .expect("lookup should work")
            .expect("combo record should exist");
        assert_eq!(stored.combo, Some(ComboTier::Double));
        assert_eq!(ledger.record_count().expect("count"), 2);

        ledger.save_checkpoint("ws", 40).expect("save should work");
        assert_eq!(ledger.checkpoint("ws").expect("checkpoint"), Some(40));
        cleanup(&path);
    }

    #[test]
    fn lifetime_stats_accumulate_once_per_event() {
        let (ledger, path) = temp_ledger("stats");
        let mut scott = StatDelta::new("Scott");
        scott.kills = 1;
        scott.streak = 3;
        scott.rank = Some(StyleRank::SSS);
        scott.sss_reached = true;
        let mut boris = StatDelta::new("Boris");
        boris.deaths = 1;
        let records = [record("server.log:1", "Scott", 5_000)];
        let deltas = [scott.clone(), boris];
        ledger
            .commit_event(&EventCommit {
                records: &records,
                stats: &deltas,
                checkpoint: at_seq("server.log", 1),
            })
            .expect("commit should land");

        // same event again: duplicate record, stale checkpoint
        ledger
            .commit_event(&EventCommit {
                records: &records,
                stats: &deltas,
                checkpoint: at_seq("server.log", 1),
            })
            .expect("replay should be harmless");
        // stale checkpoint alone also blocks an event with no records
        let mut late_death = StatDelta::new("Scott");
        late_death.deaths = 1;
        ledger
            .commit_event(&EventCommit {
                records: &[],
                stats: std::slice::from_ref(&late_death),
                checkpoint: at_seq("server.log", 1),
            })
            .expect("stale commit should be harmless");

        let mut calmer = StatDelta::new("Scott");
        calmer.kills = 1;
        calmer.streak = 1;
        calmer.rank = Some(StyleRank::C);
        let mut win = StatDelta::new("Scott");
        win.wins = 1;
        ledger
            .commit_event(&EventCommit {
                records: &[],
                stats: &[calmer, win],
                checkpoint: at_seq("server.log", 2),
            })
            .expect("commit should land");

        let stats = ledger.lifetime_stats("Scott").expect("stats should load");
        assert_eq!(
            stats,
            LifetimeStats {
                kills: 2,
                deaths: 0,
                wins: 1,
                best_streak: 3,
                highest_rank: Some(StyleRank::SSS),
                sss_count: 1,
            }
        );
        assert_eq!(ledger.lifetime_stats("Boris").expect("stats").deaths, 1);
        assert_eq!(
            ledger.lifetime_stats("Nobody").expect("stats"),
            LifetimeStats::default()
        );

        let profile = ledger.profile("Scott").expect("profile should load");
        assert_eq!(profile.total.units(), 5_000);
        assert_eq!(profile.records, 1);
        assert_eq!(profile.kd, 2.0);
        assert_eq!(profile.progression.title, "Unranked");
        cleanup(&path);
    }

    #[test]
    fn log_position_moves_with_the_checkpoint() {
        let (ledger, path) = temp_ledger("position");
        assert_eq!(ledger.log_position("file:server.log").expect("position"), None);

        let head: Arc<[u8]> = Arc::from(&b"Scott fragged Boris\n"[..]);
        let later = LogPosition {
            offset: 40,
            head: head.clone(),
            anchor: b"Boris fragged Scott\n".to_vec(),
        };
        let earlier = LogPosition {
            offset: 20,
            head,
            anchor: b"Scott fragged Boris\n".to_vec(),
        };
        for (seq, position) in [(2, &later), (1, &earlier)] {
            ledger
                .commit_event(&EventCommit {
                    checkpoint: Some(Checkpoint {
                        source: "file:server.log",
                        seq,
                        position: Some(position),
                    }),
                    ..EventCommit::default()
                })
                .expect("commit should land");
        }
        assert_eq!(
            ledger.log_position("file:server.log").expect("position"),
            Some(later)
        );
        assert_eq!(ledger.checkpoint("file:server.log").expect("checkpoint"), Some(2));
        cleanup(&path);
    }

    #[test]
    fn concurrent_credits_for_one_event_land_once() {
        let (ledger, path) = temp_ledger("concurrent");
        let barrier = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    ledger.credit(&record("server.log:9", "Scott", 1_000))
                })
            })
            .collect();
        let results: Vec<_> = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker should not panic"))
            .collect();

        let credited = results.iter().filter(|result| result.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|result| matches!(result, Err(LedgerError::Duplicate(id)) if id == "server.log:9"))
            .count();
        assert_eq!(credited, 1, "results: {results:?}");
        assert_eq!(duplicates, 7, "results: {results:?}");
        assert_eq!(ledger.record_count().expect("count"), 1);
        assert_eq!(ledger.total_for("Scott").expect("total").units(), 1_000);
        cleanup(&path);
    }
}
