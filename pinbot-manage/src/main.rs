//! pinbot-manage: operator commands against the pinbot database.
//!
//! Runs beside the daemon on the same `pins.db`; per-CID leases in the store
//! keep the two from interleaving writes.

mod report;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use pinbot::cache::ContentCache;
use pinbot::cid::Cid;
use pinbot::config::{build_config, Config, ConfigArgs};
use pinbot::error::PinError;
use pinbot::ipfs::IpfsClient;
use pinbot::pin::{window_hours, PinEngine, PinRecord, PinSource, PinStore, MAX_WINDOW_HOURS};

#[derive(Parser)]
#[command(name = "pinbot-manage", version, about = "Inspect and adjust pinbot's tracked pins")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show tracked pins, soonest expiry first
    Status {
        /// Include released pins still kept as history
        #[arg(long)]
        all: bool,
        /// Ask the IPFS node for sizes and untracked pins
        #[arg(long)]
        remote: bool,
    },
    /// Pin a CID, or add and pin a local file
    Pin {
        /// CID or path to a local file
        target: String,
        /// Pin window in hours (default: pin_duration_hours)
        #[arg(value_parser = clap::value_parser!(u64).range(1..=MAX_WINDOW_HOURS))]
        duration_hours: Option<u64>,
    },
    /// Push a live pin's expiry out
    Extend {
        cid: String,
        #[arg(value_parser = clap::value_parser!(u64).range(1..=MAX_WINDOW_HOURS))]
        extra_hours: u64,
    },
    /// Release a live pin now
    Unpin { cid: String },
}

/// Exit status per failure kind.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PinError>() {
        Some(PinError::InvalidCid { .. } | PinError::InvalidDuration { .. }) => 2,
        Some(PinError::NotFound { .. }) => 3,
        Some(PinError::Remote { .. }) => 4,
        Some(e) if e.is_store_failure() => 5,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pinbot=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    match run(cli, &matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let config = build_config(&cli.config, matches)?;
    std::fs::create_dir_all(&config.data_dir)?;
    let store = PinStore::open(&config.db_path())?;
    let ipfs = Arc::new(IpfsClient::new(&config.ipfs_api_url));
    let mut engine = PinEngine::new(store, ipfs.clone(), config.engine_settings());
    if let Some(dir) = &config.download_dir {
        engine = engine.with_cache(ContentCache::new(dir));
    }

    match cli.command {
        Command::Status { all, remote } => status(&engine, &ipfs, &config, all, remote).await,
        Command::Pin {
            target,
            duration_hours,
        } => {
            let hours = duration_hours.unwrap_or(config.pin_duration_hours);
            let record = pin(&engine, &target, window_hours(hours)?).await?;
            println!(
                "Pinned {} ({}) until {}",
                record.cid,
                record.source,
                record.expires_at.format("%Y-%m-%d %H:%M UTC")
            );
            Ok(())
        }
        Command::Extend { cid, extra_hours } => {
            let cid = Cid::parse(&cid)?;
            let record = engine.extend(&cid, window_hours(extra_hours)?).await?;
            println!(
                "Extended {} until {}",
                record.cid,
                record.expires_at.format("%Y-%m-%d %H:%M UTC")
            );
            Ok(())
        }
        Command::Unpin { cid } => {
            let cid = Cid::parse(&cid)?;
            let record = engine.unpin(&cid).await?;
            println!("Unpinned {}", record.cid);
            Ok(())
        }
    }
}

/// A CID is pinned directly; an existing file is added first.
async fn pin(engine: &PinEngine, target: &str, duration: chrono::Duration) -> Result<PinRecord, PinError> {
    if let Ok(cid) = Cid::parse(target) {
        return engine.observe(&cid, PinSource::Manual, duration).await;
    }
    let path = Path::new(target);
    if path.is_file() {
        return engine.add_local(path, duration).await;
    }
    Err(PinError::InvalidCid {
        input: target.to_string(),
    })
}

async fn status(
    engine: &PinEngine,
    ipfs: &IpfsClient,
    config: &Config,
    all: bool,
    remote: bool,
) -> anyhow::Result<()> {
    let mut records = engine.status_report().await?;
    if !all {
        records.retain(PinRecord::is_live);
    }
    let now = Utc::now();

    if !remote {
        print!("{}", report::render_table(&records, now, None));
        return Ok(());
    }

    let timeout = std::time::Duration::from_secs(config.remote_timeout_secs);
    let remote_pins = match tokio::time::timeout(timeout, ipfs.list_pins()).await {
        Ok(Ok(pins)) => pins,
        Ok(Err(e)) => {
            eprintln!("warning: IPFS node unavailable, showing store only: {e}");
            print!("{}", report::render_table(&records, now, None));
            return Ok(());
        }
        Err(_) => {
            eprintln!("warning: IPFS node timed out, showing store only");
            print!("{}", report::render_table(&records, now, None));
            return Ok(());
        }
    };

    let mut sizes = HashMap::new();
    for record in records.iter().filter(|r| r.is_live()) {
        match tokio::time::timeout(timeout, ipfs.content_size(&record.cid)).await {
            Ok(Ok(size)) => {
                sizes.insert(record.cid.clone(), size);
            }
            Ok(Err(e)) => tracing::debug!(cid = %record.cid, error = %e, "size lookup failed"),
            Err(_) => tracing::debug!(cid = %record.cid, "size lookup timed out"),
        }
    }

    let tracked: BTreeSet<&Cid> = records.iter().filter(|r| r.is_live()).map(|r| &r.cid).collect();
    let untracked: Vec<Cid> = remote_pins
        .into_iter()
        .filter(|cid| !tracked.contains(cid))
        .collect();

    print!("{}", report::render_table(&records, now, Some(&sizes)));
    print!("{}", report::render_untracked(&untracked));
    Ok(())
}
