//! mailsyncd - incremental mailbox sync service
//!
//! Polls the mailbox on a fixed interval and stores new messages in a local
//! SQLite database. The read-only subcommands report on what is stored.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use log::{error, info};
use mailsync::report::{
    ReportFilter, ReportWindow, format_message_detail, format_summary_list, get_message_detail,
    list_report,
};
use mailsync::storage::{MessageStore, SqliteMessageStore};
use mailsync::sync::{PollScheduler, Shutdown, SyncContext, SyncEngine};
use mailsync::{GmailClient, MessageId, SyncConfig, access_token_from_env};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mailsyncd")]
#[command(about = "Incremental mailbox sync service")]
struct Cli {
    /// Config file to use instead of ~/.config/mailsync/mailsync.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the mailbox until interrupted
    Run {
        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<usize>,
    },
    /// Run a single sync cycle and exit
    Once,
    /// List stored messages
    Report {
        /// Only messages from the last N days
        #[arg(long, conflicts_with_all = ["since", "until"])]
        days: Option<u32>,
        /// Only messages received on or after this date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date, requires = "until")]
        since: Option<NaiveDate>,
        /// Only messages received on or before this date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date, requires = "since")]
        until: Option<NaiveDate>,
        /// Case-insensitive sender substring
        #[arg(long, short = 's')]
        sender: Option<String>,
        /// Only processed messages
        #[arg(long, conflicts_with = "unprocessed")]
        processed: bool,
        /// Only unprocessed messages
        #[arg(long)]
        unprocessed: bool,
        /// Page number, starting at 1
        #[arg(long, requires = "per_page")]
        page: Option<usize>,
        /// Messages per page (1-100)
        #[arg(long)]
        per_page: Option<usize>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show one stored message in full
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Print processed/unprocessed counts
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Write a config file with default settings
    InitConfig {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Flag messages as handled by a downstream consumer
    MarkProcessed {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // Configuration problems are fatal before anything runs
    let load = || load_config(config_path);

    match cli.command {
        Commands::Run { max_cycles } => run(load()?, max_cycles).await,
        Commands::Once => once(load()?),
        Commands::Report {
            days,
            since,
            until,
            sender,
            processed,
            unprocessed,
            page,
            per_page,
            json,
        } => {
            let mut filter = ReportFilter::default();
            if let Some(days) = days {
                filter = filter.window(ReportWindow::LastDays(days));
            }
            if let (Some(since), Some(until)) = (since, until) {
                filter = filter.window(ReportWindow::Range {
                    since: start_of_day(since),
                    until: end_of_day(until),
                });
            }
            if let Some(sender) = sender {
                filter = filter.sender(sender);
            }
            if processed {
                filter = filter.processed(true);
            } else if unprocessed {
                filter = filter.processed(false);
            }
            match (page, per_page) {
                (Some(page), Some(per_page)) => filter = filter.paged(page, per_page),
                (None, Some(per_page)) => filter = filter.paged(1, per_page),
                _ => {}
            }
            report(&load()?, &filter, json)
        }
        Commands::Show { id, json } => show(&load()?, &id, json),
        Commands::Stats { json } => stats(&load()?, json),
        Commands::MarkProcessed { ids } => mark_processed(&load()?, &ids),
        Commands::InitConfig { force } => init_config(config_path, force),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let cfg = match path {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::load()?,
    };
    info!(
        "Config: interval {}s, max_results {:?}, query {:?}",
        cfg.poll_interval_secs, cfg.max_results, cfg.query
    );
    Ok(cfg)
}

fn open_store(cfg: &SyncConfig) -> Result<Arc<SqliteMessageStore>> {
    let db_path = cfg.resolved_database_path()?;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    info!("Opening message store at {}", db_path.display());
    Ok(Arc::new(SqliteMessageStore::new(&db_path)?))
}

fn build_engine(cfg: &SyncConfig) -> Result<SyncEngine> {
    let token = access_token_from_env()?;
    let store = open_store(cfg)?;
    let source = GmailClient::new(token);
    let ctx = SyncContext::new(Box::new(source), store, cfg.sync_options());
    Ok(SyncEngine::bootstrap(ctx))
}

async fn run(cfg: SyncConfig, max_cycles: Option<usize>) -> Result<()> {
    let mut engine = build_engine(&cfg)?;
    let mut options = cfg.scheduler_options();
    options.max_cycles = max_cycles;

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.trigger();
    });

    // The poll loop blocks on I/O and sleeps; keep it off the async workers
    let report = tokio::task::spawn_blocking(move || {
        PollScheduler::new(options).run(&mut engine, &shutdown)
    })
    .await
    .context("Poll loop panicked")?;

    info!(
        "Shutdown complete: {} cycles, {} failed, {} messages stored",
        report.cycles, report.failed_cycles, report.messages_stored
    );
    Ok(())
}

fn once(cfg: SyncConfig) -> Result<()> {
    let mut engine = build_engine(&cfg)?;
    let result = engine.run_cycle()?;
    println!(
        "Fetched {}, stored {}, failed {}; watermark {}",
        result.fetched,
        result.stored_count,
        result.failed.len(),
        result.new_watermark
    );
    Ok(())
}

fn report(cfg: &SyncConfig, filter: &ReportFilter, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let messages = list_report(store.as_ref(), filter, Utc::now())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
    } else {
        print!("{}", format_summary_list(&filter.title(), &messages));
        println!();
    }
    Ok(())
}

fn show(cfg: &SyncConfig, id: &str, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let Some(message) = get_message_detail(store.as_ref(), &MessageId::new(id))? else {
        bail!("No message with id {}", id);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&message)?);
    } else {
        print!("{}", format_message_detail(&message));
    }
    Ok(())
}

fn stats(cfg: &SyncConfig, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let counts = store.count_by_status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        println!("Total:       {}", counts.total);
        println!("Processed:   {}", counts.processed);
        println!("Unprocessed: {}", counts.unprocessed);
    }
    Ok(())
}

fn mark_processed(cfg: &SyncConfig, ids: &[String]) -> Result<()> {
    let store = open_store(cfg)?;
    let ids: Vec<MessageId> = ids.iter().map(MessageId::new).collect();
    let updated = store.mark_processed(&ids)?;
    println!("Marked {} of {} messages as processed", updated, ids.len());
    Ok(())
}

fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let target = match path {
        Some(path) => path.to_path_buf(),
        None => SyncConfig::default_config_path().context("Could not determine config directory")?,
    };
    if target.exists() && !force {
        bail!("{} already exists (use --force to replace it)", target.display());
    }
    let written = SyncConfig::default().save(path)?;
    println!("Wrote default config to {}", written.display());
    Ok(())
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|| start_of_day(date))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current cycle before exit");
        },
        _ = terminate => {
            info!("Received SIGTERM, finishing current cycle before exit");
        },
    }
}
