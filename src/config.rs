use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::PinError;
use crate::ingest::IngestSettings;
use crate::pin::{window_hours, EngineSettings, MAX_WINDOW_HOURS};
use crate::sweeper::SweepSettings;

/// Upper bound for `remote_timeout_secs`; lease TTLs are derived from it.
const MAX_REMOTE_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub signal_api_url: String,
    /// Bot account. When unset, the first account registered with the
    /// signal API is used.
    pub signal_number: Option<String>,
    pub ipfs_api_url: String,
    /// Local content cache. When unset, nothing is downloaded.
    pub download_dir: Option<PathBuf>,
    pub fetch_interval_secs: u64,
    pub pin_duration_hours: u64,
    pub sweep_interval_secs: u64,
    pub remote_timeout_secs: u64,
    pub store_retry_attempts: u32,
    /// How long released pins stay visible in `status --all`. 0 keeps them.
    pub unpinned_retention_hours: u64,
    pub reply_to_sender: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            signal_api_url: "http://localhost:8080".to_string(),
            signal_number: None,
            ipfs_api_url: "http://localhost:5001".to_string(),
            download_dir: None,
            fetch_interval_secs: 5,
            pin_duration_hours: 72,
            sweep_interval_secs: 60,
            remote_timeout_secs: 30,
            store_retry_attempts: 5,
            unpinned_retention_hours: 168,
            reply_to_sender: true,
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("pins.db")
    }

    /// Returns the default config file path for a given data directory.
    pub fn config_file_path(data_dir: &Path) -> PathBuf {
        data_dir.join("config.yaml")
    }

    /// Load config from a YAML file. Returns None if the file does not exist.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Option<Config>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(Some(config))
    }

    /// Write the commented template. Refuses to overwrite an existing file.
    pub fn write_default_config(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!(
                "config file already exists: {}. Remove it first to regenerate.",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let template = include_str!("config_template.yaml");
        std::fs::write(path, template)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the config for obvious errors.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("fetch_interval_secs", self.fetch_interval_secs),
            ("pin_duration_hours", self.pin_duration_hours),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("remote_timeout_secs", self.remote_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        for (name, value) in [
            ("pin_duration_hours", self.pin_duration_hours),
            ("unpinned_retention_hours", self.unpinned_retention_hours),
        ] {
            if value > MAX_WINDOW_HOURS {
                anyhow::bail!("{name} must be at most {MAX_WINDOW_HOURS}");
            }
        }
        if self.remote_timeout_secs > MAX_REMOTE_TIMEOUT_SECS {
            anyhow::bail!("remote_timeout_secs must be at most {MAX_REMOTE_TIMEOUT_SECS}");
        }
        if self.store_retry_attempts == 0 {
            anyhow::bail!("store_retry_attempts must be at least 1");
        }
        for (name, url) in [
            ("signal_api_url", &self.signal_api_url),
            ("ipfs_api_url", &self.ipfs_api_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{name} must start with http:// or https://: {url}");
            }
        }
        if let Some(number) = &self.signal_number {
            if !number.starts_with('+') {
                tracing::warn!(number = %number, "signal_number is usually in +E.164 form");
            }
        }
        Ok(())
    }

    pub fn pin_duration(&self) -> Result<chrono::Duration, PinError> {
        window_hours(self.pin_duration_hours)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            remote_timeout: Duration::from_secs(self.remote_timeout_secs),
            store_retry_attempts: self.store_retry_attempts,
        }
    }

    pub fn ingest_settings(&self) -> Result<IngestSettings, PinError> {
        Ok(IngestSettings {
            fetch_interval: Duration::from_secs(self.fetch_interval_secs),
            pin_duration: self.pin_duration()?,
            reply_to_sender: self.reply_to_sender,
        })
    }

    pub fn sweep_settings(&self) -> Result<SweepSettings, PinError> {
        Ok(SweepSettings {
            interval: Duration::from_secs(self.sweep_interval_secs),
            unpinned_retention: window_hours(self.unpinned_retention_hours)?,
        })
    }
}

/// Flags shared by the daemon and the management CLI. Each can also come
/// from the environment.
#[derive(Debug, Clone, clap::Args)]
pub struct ConfigArgs {
    /// Path to YAML config file (default: <data_dir>/config.yaml)
    #[arg(long, env = "PINBOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding pins.db
    #[arg(long, env = "PINBOT_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// signal-cli-rest-api base URL
    #[arg(long, env = "SIGNAL_API_URL")]
    pub signal_api_url: Option<String>,

    /// Bot account number
    #[arg(long, env = "SIGNAL_NUMBER")]
    pub signal_number: Option<String>,

    /// Kubo RPC base URL
    #[arg(long, env = "IPFS_API_URL")]
    pub ipfs_api_url: Option<String>,

    /// Download pinned content into this directory
    #[arg(long, env = "IPFS_DOWNLOAD_DIR")]
    pub download_dir: Option<PathBuf>,

    /// Seconds between chat polls
    #[arg(long, env = "FETCH_INTERVAL")]
    pub fetch_interval_secs: Option<u64>,

    /// Pin window for sighted CIDs, in hours
    #[arg(long, env = "PIN_DURATION")]
    pub pin_duration_hours: Option<u64>,

    /// Seconds between expiry sweeps
    #[arg(long, env = "SWEEP_INTERVAL")]
    pub sweep_interval_secs: Option<u64>,

    /// Timeout for a single IPFS or signal call, in seconds
    #[arg(long, env = "REMOTE_TIMEOUT")]
    pub remote_timeout_secs: Option<u64>,
}

/// Build the final Config by merging: defaults -> YAML file -> env/CLI overrides.
pub fn build_config(args: &ConfigArgs, matches: &clap::ArgMatches) -> anyhow::Result<Config> {
    use clap::parser::ValueSource;

    // data_dir always comes from args first (needed to locate the config file).
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| Config::config_file_path(&args.data_dir));

    let mut config = match Config::load_from_file(&config_path)? {
        Some(file_config) => {
            tracing::info!(path = %config_path.display(), "loaded config file");
            file_config
        }
        None => {
            tracing::debug!(path = %config_path.display(), "no config file found, using defaults");
            Config::default()
        }
    };

    // Only an explicit --data-dir or PINBOT_DATA_DIR beats the file.
    if matches!(
        matches.value_source("data_dir"),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    ) {
        config.data_dir = args.data_dir.clone();
    }
    if let Some(url) = &args.signal_api_url {
        config.signal_api_url = url.clone();
    }
    if let Some(number) = &args.signal_number {
        config.signal_number = Some(number.clone());
    }
    if let Some(url) = &args.ipfs_api_url {
        config.ipfs_api_url = url.clone();
    }
    if let Some(dir) = &args.download_dir {
        config.download_dir = Some(dir.clone());
    }
    if let Some(secs) = args.fetch_interval_secs {
        config.fetch_interval_secs = secs;
    }
    if let Some(hours) = args.pin_duration_hours {
        config.pin_duration_hours = hours;
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.sweep_interval_secs = secs;
    }
    if let Some(secs) = args.remote_timeout_secs {
        config.remote_timeout_secs = secs;
    }

    config.validate()?;
    Ok(config)
}
