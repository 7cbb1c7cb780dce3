mod amount;
mod combo;
mod config;
mod error;
mod events;
mod feed;
mod ledger;
mod notify;
mod pipeline;
mod policy;
mod progression;
mod protocol;
mod rank;
mod registry;
mod server;
mod sources;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    amount::Amount,
    config::BridgeConfig,
    events::FeedEvent,
    feed::{EventFeed, FeedCounters},
    ledger::{LedgerStore, RewardLedger},
    notify::NotificationSink,
    pipeline::{run_consumer, RewardPipeline},
    server::ServerState,
    sources::{log_source_name, read_finished_log, run_ws_source, tail_log, ws_source_name, LogStart},
};

const HTTP_SOURCE: &str = "http";

#[derive(Debug, Parser)]
#[command(name = "arena-rewards", version, about = "Arena reward bridge")]
struct Cli {
    /// Config file to use instead of the per-user default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Follow the configured sources and credit rewards until Ctrl-C.
    Run,
    /// Credit every record of a finished log file, then exit.
    Replay {
        file: PathBuf,
        /// Checkpoint name; defaults to the one `run` uses for the same path.
        #[arg(long)]
        source: Option<String>,
    },
    Total {
        player: String,
    },
    Leaderboard {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Recent {
        player: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Lifetime stats and progression tier.
    Profile {
        player: String,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (config, config_path) = BridgeConfig::load(cli.config.as_deref())?;
    info!(path = %config_path.display(), "loaded config");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_bridge(config).await,
        Command::Replay { file, source } => tokio::task::spawn_blocking(move || {
            replay(config, file, source)
        })
        .await
        .context("replay task panicked")?,
        Command::Total { player } => {
            let ledger = RewardLedger::open_from_config(&config)?;
            let total = ledger.total_for(&player)?;
            println!("{player}\t{total}");
            Ok(())
        }
        Command::Leaderboard { limit } => {
            let ledger = RewardLedger::open_from_config(&config)?;
            for (idx, entry) in ledger.leaderboard(limit)?.iter().enumerate() {
                println!(
                    "{:>3}. {:<24} {:>16} ({} records)",
                    idx + 1,
                    entry.player,
                    entry.total.to_string(),
                    entry.records
                );
            }
            Ok(())
        }
        Command::Recent { player, limit } => {
            let ledger = RewardLedger::open_from_config(&config)?;
            for record in ledger.recent_records(&player, limit)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.at.to_rfc3339(),
                    record.event_id,
                    record.source,
                    record.amount
                );
            }
            Ok(())
        }
        Command::Profile { player, json } => {
            let ledger = RewardLedger::open_from_config(&config)?;
            let profile = ledger.profile(&player)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
                return Ok(());
            }
            let stats = &profile.stats;
            println!(
                "{} - level {} {}",
                profile.player, profile.progression.level, profile.progression.title
            );
            println!("earned      {} ({} records)", profile.total, profile.records);
            println!(
                "kills       {}  deaths {}  k/d {:.2}  wins {}",
                stats.kills, stats.deaths, profile.kd, stats.wins
            );
            println!(
                "best streak {}  top rank {}  SSS reached {}",
                stats.best_streak,
                stats.highest_rank.map_or("-", |rank| rank.label()),
                stats.sss_count
            );
            if let Some(next) = &profile.progression.next {
                println!(
                    "next        {} at {} ({} to go, {}%)",
                    next.title, next.threshold, next.needed, next.progress_pct
                );
            }
            Ok(())
        }
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<()> {
    let ledger = RewardLedger::open_from_config(&config)?;
    info!(path = %ledger.path().display(), "opened reward ledger");
    let sink = NotificationSink::from_config(&config.webhook);
    let notifier = sink.handle();
    let counters = Arc::new(FeedCounters::default());
    let (tx, rx) = crossbeam_channel::unbounded::<FeedEvent>();
    let mut producers: Vec<JoinHandle<()>> = Vec::new();

    if let Some(log_path) = config
        .log_path
        .clone()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    {
        let path = PathBuf::from(log_path);
        let source = log_source_name(&path);
        let start = match ledger.log_position(&source)? {
            Some(position) => LogStart::Resume(position),
            None if config.log_from_start => LogStart::Beginning,
            None => {
                info!(source = %source, "no checkpoint; starting at end of log");
                LogStart::End
            }
        };
        let feed = EventFeed::continuing(source.clone(), ledger.checkpoint(&source)?)
            .with_counters(counters.clone());
        producers.push(tokio::spawn(tail_log(
            path,
            feed,
            start,
            Duration::from_millis(config.log_poll_ms),
            tx.clone(),
        )));
    } else {
        info!("log tail disabled (log_path is empty)");
    }

    if let Some(url) = config
        .source_ws
        .clone()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    {
        let source = ws_source_name(&url);
        let feed = EventFeed::continuing(source.clone(), ledger.checkpoint(&source)?)
            .with_counters(counters.clone());
        producers.push(tokio::spawn(run_ws_source(url, feed, tx.clone())));
    } else {
        info!("websocket source disabled (source_ws is null)");
    }

    if config.http_enabled {
        let feed = EventFeed::continuing(HTTP_SOURCE, ledger.checkpoint(HTTP_SOURCE)?)
            .with_counters(counters.clone());
        let state = ServerState::new(
            ledger.clone(),
            feed,
            tx.clone(),
            counters.clone(),
            notifier.clone(),
        );
        let bind = config.http_bind.clone();
        producers.push(tokio::spawn(async move {
            if let Err(err) = server::serve(&bind, state).await {
                error!(?err, bind = %bind, "http server crashed");
            }
        }));
    } else {
        info!("http api disabled (http_enabled=false)");
    }

    if producers.is_empty() {
        warn!("no event sources configured; set log_path, source_ws or http_enabled");
    }
    drop(tx);

    let pipeline = RewardPipeline::new(ledger, &config, notifier);
    let mut consumer = tokio::task::spawn_blocking(move || run_consumer(pipeline, rx));

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(?err, "failed listening for ctrl-c; shutting down");
            }
            info!("shutdown requested");
            None
        }
        joined = &mut consumer => Some(joined),
    };

    for task in &producers {
        task.abort();
    }
    for task in producers {
        let _ = task.await;
    }
    let result = match finished {
        Some(joined) => joined,
        None => consumer.await,
    }
    .context("event consumer panicked")?;

    let grace = Duration::from_millis(config.webhook.grace_ms);
    tokio::task::spawn_blocking(move || sink.shutdown(grace))
        .await
        .context("notifier shutdown panicked")?;

    match result {
        Ok(stats) => {
            info!(
                events = stats.events,
                credited = stats.credited,
                duplicates = stats.duplicates,
                "bridge stopped"
            );
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err)
            .context("ledger storage failed; feed checkpoint left at the last committed event")),
    }
}

fn replay(config: BridgeConfig, file: PathBuf, source: Option<String>) -> Result<()> {
    let ledger = RewardLedger::open_from_config(&config)?;
    let source = source.unwrap_or_else(|| log_source_name(&file));
    let checkpoint = ledger.checkpoint(&source)?;
    let position = ledger.log_position(&source)?;
    info!(
        file = %file.display(),
        source = %source,
        ?checkpoint,
        offset = position.as_ref().map(|position| position.offset),
        "replaying log"
    );
    let lines = read_finished_log(&file, position.as_ref())?;

    let sink = NotificationSink::from_config(&config.webhook);
    let mut pipeline = RewardPipeline::new(ledger, &config, sink.handle());
    let mut feed = EventFeed::continuing(source, checkpoint);
    let mut credited = 0usize;
    let mut earned = Amount::ZERO;
    for (line, position) in lines {
        let Some(event) = feed.push_line(&line, Utc::now()) else {
            continue;
        };
        let event = event.with_position(position);
        let report = pipeline
            .process(&event)
            .with_context(|| format!("ledger storage failed at {}", event.id))?;
        credited += report.credited.len();
        earned = earned + report.credited.iter().map(|record| record.amount).sum::<Amount>();
    }
    let feed_stats = feed.stats();
    let stats = pipeline.stats();
    drop(pipeline);
    sink.shutdown(Duration::from_millis(config.webhook.grace_ms));

    if feed_stats.unstamped > 0 {
        warn!(
            unstamped = feed_stats.unstamped,
            "lines without a [unix] prefix were timed at replay; combo windows and idle decay treat them as back to back"
        );
    }
    println!(
        "replayed {} events ({} ignored, {} malformed, {} without timestamps)",
        feed_stats.parsed, feed_stats.ignored, feed_stats.malformed, feed_stats.unstamped
    );
    println!(
        "credited {credited} records worth {earned} ({} duplicates)",
        stats.duplicates
    );
    Ok(())
}
