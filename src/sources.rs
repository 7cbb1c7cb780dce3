use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::Sender;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::{
    events::{FeedEvent, LogPosition},
    feed::EventFeed,
};

const HEAD_BYTES: usize = 256;
const ANCHOR_BYTES: usize = 64;

/// Source name used for checkpoints of a followed log file.
pub fn log_source_name(path: &Path) -> String {
    format!("file:{}", path.display())
}

pub fn ws_source_name(url: &str) -> String {
    format!("ws:{url}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStart {
    Beginning,
    /// Skip whatever the file holds when it is first read.
    End,
    Resume(LogPosition),
}

/// Read position in one log file. `offset` is the end of the last complete
/// line; `head` and `recent` are the bytes that tie the offset to the file.
#[derive(Debug, Clone)]
struct LogCursor {
    offset: u64,
    pending: Vec<u8>,
    head: Arc<[u8]>,
    recent: Vec<u8>,
}

impl LogCursor {
    fn start() -> Self {
        Self {
            offset: 0,
            pending: Vec::new(),
            head: Arc::from(Vec::new()),
            recent: Vec::new(),
        }
    }

    fn at(position: &LogPosition) -> Self {
        Self {
            offset: position.offset,
            pending: Vec::new(),
            head: position.head.clone(),
            recent: position.anchor.clone(),
        }
    }

    fn read_to(&self) -> u64 {
        self.offset + self.pending.len() as u64
    }

    fn anchor_start(&self) -> u64 {
        self.offset.saturating_sub(self.recent.len() as u64)
    }

    /// Starts over from the top when the file at `path` is no longer the one
    /// the cursor was reading: it shrank, its first bytes changed, or the
    /// bytes before the offset differ. Returns true on restart.
    fn reconcile(&mut self, path: &Path, len: u64, head: &[u8], before_offset: &[u8]) -> bool {
        let same_file = len >= self.read_to()
            && head.starts_with(&self.head)
            && before_offset == self.recent.as_slice();
        if !same_file {
            warn!(
                path = %path.display(),
                previous = self.offset,
                len,
                "log rotated or truncated; reading from start"
            );
            *self = Self::start();
        }
        if head.len() > self.head.len() {
            self.head = Arc::from(head);
        }
        !same_file
    }

    fn position(&self) -> LogPosition {
        LogPosition {
            offset: self.offset,
            head: self.head.clone(),
            anchor: self.recent.clone(),
        }
    }

    fn advance(&mut self, line: &[u8]) {
        self.offset += line.len() as u64;
        self.recent.extend_from_slice(line);
        if self.recent.len() > ANCHOR_BYTES {
            let excess = self.recent.len() - ANCHOR_BYTES;
            self.recent.drain(..excess);
        }
    }

    /// Splits appended bytes into complete lines, each paired with the
    /// position just past it. A partial trailing line waits for its newline.
    fn push_bytes(&mut self, chunk: &[u8]) -> Vec<(String, LogPosition)> {
        self.pending.extend_from_slice(chunk);
        let pending = std::mem::take(&mut self.pending);
        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(idx) = pending[consumed..].iter().position(|byte| *byte == b'\n') {
            let line = &pending[consumed..consumed + idx + 1];
            self.advance(line);
            lines.push((decode_line(&line[..line.len() - 1]), self.position()));
            consumed += idx + 1;
        }
        self.pending = pending[consumed..].to_vec();
        lines
    }

    /// Flushes an unterminated last line; only for logs that are complete.
    fn finish(&mut self) -> Option<(String, LogPosition)> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        self.advance(&line);
        Some((decode_line(&line), self.position()))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_owned()
}

/// Reads a finished log, continuing after `resume` when it still points into
/// this file and from the top otherwise. Invalid UTF-8 is replaced, not fatal.
pub fn read_finished_log(path: &Path, resume: Option<&LogPosition>) -> Result<Vec<(String, LogPosition)>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mut cursor = resume.map_or_else(LogCursor::start, LogCursor::at);
    let head = &bytes[..bytes.len().min(HEAD_BYTES)];
    let before = usize::try_from(cursor.anchor_start())
        .ok()
        .zip(usize::try_from(cursor.offset).ok())
        .and_then(|(from, to)| bytes.get(from..to))
        .unwrap_or_default();
    if !cursor.reconcile(path, bytes.len() as u64, head, before) && cursor.offset > 0 {
        info!(path = %path.display(), offset = cursor.offset, "resuming after the last committed line");
    }
    let from = usize::try_from(cursor.read_to()).unwrap_or(bytes.len()).min(bytes.len());
    let mut lines = cursor.push_bytes(&bytes[from..]);
    lines.extend(cursor.finish());
    Ok(lines)
}

/// Follows a growing log file from `start`. Partial trailing lines wait for
/// their newline; a truncated or replaced file is read again from the top
/// while sequence numbers keep counting.
pub async fn tail_log(
    path: PathBuf,
    mut feed: EventFeed,
    start: LogStart,
    poll: Duration,
    tx: Sender<FeedEvent>,
) {
    let poll = poll.max(Duration::from_millis(10));
    let mut cursor = match &start {
        LogStart::Resume(position) => LogCursor::at(position),
        LogStart::Beginning | LogStart::End => LogCursor::start(),
    };
    let mut skip_existing = start == LogStart::End;
    let mut missing_logged = false;
    info!(
        path = %path.display(),
        source = %feed.source(),
        next_seq = feed.next_seq(),
        offset = cursor.offset,
        "following log"
    );

    loop {
        match read_appended(&path, &mut cursor).await {
            Ok(lines) if skip_existing => {
                debug!(skipped = lines.len(), offset = cursor.offset, "starting at end of log");
            }
            Ok(lines) => {
                missing_logged = false;
                for (line, position) in lines {
                    let Some(event) = feed.push_line(&line, Utc::now()) else {
                        continue;
                    };
                    if tx.send(event.with_position(position)).is_err() {
                        error!("event consumer dropped; stopping log tail");
                        return;
                    }
                }
            }
            Err(err) => {
                if !missing_logged {
                    warn!(?err, path = %path.display(), "log not readable yet; waiting");
                    missing_logged = true;
                }
            }
        }
        skip_existing = false;
        sleep(poll).await;
    }
}

async fn read_at(file: &mut tokio::fs::File, at: u64, len: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(at)).await?;
    let mut buf = vec![0; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn read_appended(path: &Path, cursor: &mut LogCursor) -> Result<Vec<(String, LogPosition)>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed opening {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata for {}", path.display()))?
        .len();
    let head = read_at(&mut file, 0, len.min(HEAD_BYTES as u64) as usize)
        .await
        .with_context(|| format!("failed reading head of {}", path.display()))?;
    let before = if cursor.offset <= len {
        let from = cursor.anchor_start();
        read_at(&mut file, from, (cursor.offset - from) as usize)
            .await
            .with_context(|| format!("failed reading {}", path.display()))?
    } else {
        Vec::new()
    };
    cursor.reconcile(path, len, &head, &before);

    let from = cursor.read_to();
    if len <= from {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(from))
        .await
        .with_context(|| format!("failed seeking {}", path.display()))?;
    let mut chunk = Vec::new();
    file.read_to_end(&mut chunk)
        .await
        .with_context(|| format!("failed reading {}", path.display()))?;
    Ok(cursor.push_bytes(&chunk))
}

/// Connects to a websocket text feed and reconnects every 2s after a drop.
pub async fn run_ws_source(url: String, mut feed: EventFeed, tx: Sender<FeedEvent>) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((mut stream, _response)) => {
                info!(url = %url, "connected to event source");
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(Message::Text(text)) => {
                            for line in text.lines() {
                                if let Some(event) = feed.push_line(line, Utc::now()) {
                                    if tx.send(event).is_err() {
                                        error!("event consumer dropped; shutting down ws source");
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(?err, url = %url, "event source read error");
                            break;
                        }
                    }
                }
                warn!(url = %url, "event source disconnected, retrying");
            }
            Err(err) => {
                debug!(?err, url = %url, "failed to connect to event source, retrying");
            }
        }

        sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
        time::{Duration, SystemTime},
    };

    use crossbeam_channel::{unbounded, Receiver};

    use super::{read_finished_log, tail_log, LogStart};
    use crate::{
        config::BridgeConfig,
        events::{FeedEvent, GameEvent},
        feed::EventFeed,
        ledger::{LedgerStore, RewardLedger},
        notify::NotifierHandle,
        pipeline::RewardPipeline,
    };

    fn temp_path(tag: &str, ext: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("arena_rewards_{tag}_{unique}.{ext}"))
    }

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .expect("should reopen temp log");
        file.write_all(text.as_bytes()).expect("should append");
    }

    async fn next_event(rx: &Receiver<FeedEvent>) -> FeedEvent {
        let rx = rx.clone();
        tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .expect("join should work")
            .expect("event should arrive")
    }

    #[test]
    fn finished_log_keeps_crlf_bad_utf8_and_last_partial_line() {
        let path = temp_path("read", "log");
        fs::write(&path, b"Scott fragged Boris\r\n\xffnoise\nlast").expect("should write temp log");
        let lines = read_finished_log(&path, None).expect("should read");
        fs::remove_file(&path).ok();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].0, "Scott fragged Boris");
        assert_eq!(lines[0].1.offset, 21);
        assert!(lines[1].0.ends_with("noise"));
        assert_eq!(lines[2].0, "last");
        assert_eq!(lines[2].1.offset, 32);
    }

    #[test]
    fn finished_log_resumes_only_inside_the_same_file() {
        let path = temp_path("resume", "log");
        let banner = format!("# {}\n", "=".repeat(300));
        fs::write(&path, format!("{banner}Scott fragged Boris\nBoris fragged Scott\n"))
            .expect("should write temp log");
        let first = read_finished_log(&path, None).expect("should read");
        assert_eq!(first.len(), 3);
        let position = first.last().expect("three lines").1.clone();
        assert_eq!(position.offset, 343);
        assert_eq!(position.head.len(), 256);
        assert_eq!(position.anchor.len(), 64);
        assert!(position.anchor.ends_with(b"Boris fragged Scott\n"));

        append(&path, "Sophia fragged Scott\n");
        let appended = read_finished_log(&path, Some(&position)).expect("should read");
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].0, "Sophia fragged Scott");

        // same first bytes and length, different line before the offset
        fs::write(
            &path,
            format!("{banner}Scott fragged Boris\nBoris fragged Zeddo\nSophia fragged Scott\n"),
        )
        .expect("should rewrite temp log");
        let rewritten = read_finished_log(&path, Some(&position)).expect("should read");
        assert_eq!(rewritten.len(), 4);

        fs::write(&path, "Grunt fragged Tank\n").expect("should rotate temp log");
        let rotated = read_finished_log(&path, Some(&position)).expect("should read");
        fs::remove_file(&path).ok();
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].0, "Grunt fragged Tank");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tail_handles_partial_lines_and_truncation() {
        let path = temp_path("tail", "log");
        fs::write(&path, "Scott fragged Boris\nSophia di").expect("should write temp log");
        let (tx, rx) = unbounded();
        let feed = EventFeed::continuing("server.log", None);
        let task = tokio::spawn(tail_log(
            path.clone(),
            feed,
            LogStart::Beginning,
            Duration::from_millis(10),
            tx,
        ));

        let first = next_event(&rx).await;
        assert_eq!(first.seq, 1);
        assert_eq!(first.position.as_ref().map(|position| position.offset), Some(20));

        append(&path, "ed\n");
        let second = next_event(&rx).await;
        assert_eq!(second.seq, 2);
        assert!(matches!(second.event, GameEvent::Death { ref actor, .. } if actor == "Sophia"));

        fs::write(&path, "Boris fragged Scott\n").expect("should truncate temp log");
        let third = next_event(&rx).await;
        assert_eq!(third.seq, 3);
        assert!(matches!(third.event, GameEvent::Kill { ref actor, .. } if actor == "Boris"));

        task.abort();
        fs::remove_file(&path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tail_from_end_skips_existing_lines() {
        let path = temp_path("tail_end", "log");
        fs::write(&path, "Scott fragged Boris\nBoris fragged Scott\n").expect("should write temp log");
        let (tx, rx) = unbounded();
        let task = tokio::spawn(tail_log(
            path.clone(),
            EventFeed::continuing("server.log", None),
            LogStart::End,
            Duration::from_millis(10),
            tx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&path, "Sophia fragged Scott\n");
        let event = next_event(&rx).await;
        assert_eq!(event.seq, 1);
        assert!(matches!(event.event, GameEvent::Kill { ref actor, .. } if actor == "Sophia"));
        task.abort();
        fs::remove_file(&path).ok();
    }

    /// Runs one bridge session: tails `path` from the stored position and
    /// credits `expected` events before stopping.
    async fn run_session(path: &Path, ledger: &RewardLedger, expected: usize) -> Vec<u64> {
        let source = "file:server.log";
        let start = match ledger.log_position(source).expect("position should load") {
            Some(position) => LogStart::Resume(position),
            None => LogStart::Beginning,
        };
        let feed = EventFeed::continuing(source, ledger.checkpoint(source).expect("checkpoint"));
        let (tx, rx) = unbounded();
        let task = tokio::spawn(tail_log(
            path.to_path_buf(),
            feed,
            start,
            Duration::from_millis(10),
            tx,
        ));
        let mut pipeline =
            RewardPipeline::new(ledger.clone(), &BridgeConfig::default(), NotifierHandle::disabled());
        let mut seqs = Vec::new();
        for _ in 0..expected {
            let event = next_event(&rx).await;
            pipeline.process(&event).expect("event should commit");
            seqs.push(event.seq);
        }
        task.abort();
        let _ = task.await;
        assert!(rx.try_recv().is_err(), "no events beyond the expected ones");
        seqs
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_after_rotation_credits_new_lines() {
        let path = temp_path("rotation", "log");
        let ledger_path = temp_path("rotation", "db");
        let ledger = RewardLedger::open(ledger_path.clone()).expect("ledger should open");
        fn kills(victims: &[&str]) -> String {
            victims
                .iter()
                .map(|victim| format!("Scott fragged {victim}\n"))
                .collect()
        }

        fs::write(&path, kills(&["A", "B", "C", "D", "E"])).expect("should write temp log");
        let source = "file:server.log";
        let session = {
            let start = LogStart::Beginning;
            let feed = EventFeed::continuing(source, None);
            let (tx, rx) = unbounded();
            let task = tokio::spawn(tail_log(path.clone(), feed, start, Duration::from_millis(10), tx));
            let mut pipeline =
                RewardPipeline::new(ledger.clone(), &BridgeConfig::default(), NotifierHandle::disabled());
            for _ in 0..5 {
                pipeline.process(&next_event(&rx).await).expect("event should commit");
            }
            fs::write(&path, kills(&["F"])).expect("should truncate temp log");
            let after_truncation = next_event(&rx).await;
            pipeline.process(&after_truncation).expect("event should commit");
            task.abort();
            let _ = task.await;
            after_truncation.seq
        };
        assert_eq!(session, 6);
        assert_eq!(ledger.checkpoint(source).expect("checkpoint"), Some(6));

        // down while three more kills land in the same file
        append(&path, &kills(&["G", "H", "I"]));
        assert_eq!(run_session(&path, &ledger, 3).await, vec![7, 8, 9]);

        // down while the log is rotated to a fresh file
        fs::write(&path, kills(&["J", "K"])).expect("should rotate temp log");
        assert_eq!(run_session(&path, &ledger, 2).await, vec![10, 11]);

        for seq in 1..=11 {
            assert!(
                ledger
                    .find_record(&format!("{source}:{seq}"))
                    .expect("lookup should work")
                    .is_some(),
                "kill {seq} should be credited"
            );
        }
        assert_eq!(ledger.lifetime_stats("Scott").expect("stats").kills, 11);
        fs::remove_file(&path).ok();
        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = ledger_path.clone().into_os_string();
            candidate.push(suffix);
            fs::remove_file(PathBuf::from(candidate)).ok();
        }
    }
}
