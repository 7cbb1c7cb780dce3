use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{events::FeedEvent, protocol::parse_line};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub parsed: u64,
    pub ignored: u64,
    pub malformed: u64,
    /// Parsed text lines without a `[unix]` prefix, timed at observation.
    pub unstamped: u64,
}

/// Shared across feeds so the health endpoint sees every source.
#[derive(Debug, Default)]
pub struct FeedCounters {
    parsed: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
    unstamped: AtomicU64,
}

impl FeedCounters {
    pub fn snapshot(&self) -> FeedStats {
        FeedStats {
            parsed: self.parsed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unstamped: self.unstamped.load(Ordering::Relaxed),
        }
    }
}

/// Numbers every line of one source. Numbering continues after the stored
/// checkpoint, so ids never repeat even when a log file is rotated; log
/// files pick up where they left off through their byte position instead.
pub struct EventFeed {
    source: String,
    next_seq: u64,
    local: FeedStats,
    counters: Arc<FeedCounters>,
}

impl EventFeed {
    pub fn continuing(source: impl Into<String>, checkpoint: Option<u64>) -> Self {
        Self {
            source: source.into(),
            next_seq: checkpoint.unwrap_or(0).saturating_add(1),
            local: FeedStats::default(),
            counters: Arc::new(FeedCounters::default()),
        }
    }

    pub fn with_counters(mut self, counters: Arc<FeedCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn stats(&self) -> FeedStats {
        self.local
    }

    pub fn push_line(&mut self, line: &str, observed_at: DateTime<Utc>) -> Option<FeedEvent> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        match parse_line(line, observed_at) {
            Ok(Some(record)) => {
                self.local.parsed += 1;
                self.counters.parsed.fetch_add(1, Ordering::Relaxed);
                if !record.stamped {
                    self.local.unstamped += 1;
                    self.counters.unstamped.fetch_add(1, Ordering::Relaxed);
                }
                Some(FeedEvent::new(&self.source, seq, record.id, record.event))
            }
            Ok(None) => {
                self.local.ignored += 1;
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                self.local.malformed += 1;
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(%err, source = %self.source, seq, "dropping malformed record");
                None
            }
        }
    }
}
