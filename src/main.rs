//! pinbot daemon: pins CIDs seen in chat and releases them when their
//! window closes.
//!
//! Startup: load config → open SQLite → build the engine over the Kubo client
//! → start the ingestion loop (signal polling) and the expiry sweeper → wait
//! for Ctrl-C.

use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches, Parser};

use pinbot::cache::ContentCache;
use pinbot::config::{build_config, Config, ConfigArgs};
use pinbot::ingest::{run_ingest_loop, Ingestor};
use pinbot::ipfs::IpfsClient;
use pinbot::pin::{PinEngine, PinStore};
use pinbot::signal::SignalClient;
use pinbot::sweeper::run_sweep_loop;

#[derive(Parser)]
#[command(name = "pinbot", version, about = "Time-limited IPFS pinning for CIDs shared in chat")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Generate a default config.yaml in data-dir and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pinbot=info".into()),
        )
        .init();

    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    if cli.init_config {
        let config_path = cli
            .config
            .config
            .clone()
            .unwrap_or_else(|| Config::config_file_path(&cli.config.data_dir));
        Config::write_default_config(&config_path)?;
        println!("Config written to {}", config_path.display());
        return Ok(());
    }

    let config = build_config(&cli.config, &matches)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let store = PinStore::open(&config.db_path())?;
    match store.count_by_status() {
        Ok(counts) => {
            let summary: Vec<String> = counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
            tracing::info!(db = %config.db_path().display(), pins = %summary.join(" "), "store opened");
        }
        Err(e) => tracing::warn!(error = %e, "failed to count pins"),
    }

    let remote = Arc::new(IpfsClient::new(&config.ipfs_api_url));
    let mut engine = PinEngine::new(store, remote, config.engine_settings());
    if let Some(dir) = &config.download_dir {
        std::fs::create_dir_all(dir)?;
        tracing::info!(dir = %dir.display(), "content cache enabled");
        engine = engine.with_cache(ContentCache::new(dir));
    }

    let signal = Arc::new(
        SignalClient::new(&config.signal_api_url, config.signal_number.clone())
            .with_timeout(std::time::Duration::from_secs(config.remote_timeout_secs)),
    );
    match signal.account().await {
        Ok(number) => tracing::info!(account = %number, "signal account resolved"),
        // The ingestion loop keeps retrying.
        Err(e) => tracing::warn!(error = %e, "signal account not resolved yet"),
    }

    tracing::info!(
        signal = %config.signal_api_url,
        ipfs = %config.ipfs_api_url,
        pin_duration_hours = config.pin_duration_hours,
        "pinbot starting"
    );

    let ingestor = Ingestor::new(engine.clone(), signal, config.ingest_settings()?).await?;
    let ingest_task = tokio::spawn(run_ingest_loop(ingestor));
    let sweep_task = tokio::spawn(run_sweep_loop(engine, config.sweep_settings()?));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    ingest_task.abort();
    sweep_task.abort();

    Ok(())
}
