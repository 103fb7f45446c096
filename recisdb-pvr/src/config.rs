//! Command line arguments and the TOML configuration file.
//!
//! Command line values take precedence over the file; anything left unset
//! in both falls back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::encode::EncodeMode;
use crate::recorder::RecorderSettings;
use crate::tuner::TunerDevice;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "recisdb-pvr.toml";

const DEFAULT_RESERVES_PATH: &str = "reserves.json";
const DEFAULT_DATABASE_PATH: &str = "recisdb-pvr.db";
const DEFAULT_MIRAKURUN_URL: &str = "http://127.0.0.1:40772";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 600;

/// recisdb-pvr - Recording scheduler and encode queue
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Path to the reservation file
    #[arg(long)]
    pub reserves: Option<PathBuf>,

    /// Path to the database file
    #[arg(short, long)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    pub log_retention_days: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub reserves: ReservesSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub tuners: Vec<TunerDevice>,
    #[serde(default)]
    pub mirakurun: MirakurunSection,
    #[serde(default)]
    pub recording: RecordingSection,
    #[serde(default)]
    pub encode: EncodeSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub webhook: Option<WebhookSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReservesSection {
    pub path: Option<PathBuf>,
    pub update_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DatabaseSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
pub struct MirakurunSection {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RecordingSection {
    pub directory: Option<PathBuf>,
    pub file_extension: Option<String>,
    pub normal_priority: Option<i32>,
    pub conflict_priority: Option<i32>,
    pub check_interval_secs: Option<u64>,
    pub pre_roll_secs: Option<u64>,
    pub prep_retry_count: Option<u32>,
    pub prep_retry_delay_secs: Option<u64>,
    pub first_byte_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EncodeSection {
    pub max_slots: Option<usize>,
    pub priority: Option<i32>,
    pub directory: Option<PathBuf>,
    pub preempt_timeout_secs: Option<u64>,
    pub error_grace_ms: Option<u64>,
    #[serde(default)]
    pub modes: Vec<EncodeMode>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<PathBuf>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WebhookSection {
    pub url: String,
    /// `generic`, `discord`, `slack` or `line`.
    #[serde(default = "default_webhook_format")]
    pub format: String,
}

fn default_webhook_format() -> String {
    "generic".to_string()
}

/// Encoder settings after merging.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub max_slots: usize,
    pub directory: Option<PathBuf>,
    pub preempt_timeout: Duration,
    pub error_grace: Duration,
    pub modes: Vec<EncodeMode>,
}

/// Logging settings after merging.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub log_dir: PathBuf,
    pub retention_days: u64,
    pub level: Option<String>,
    pub verbose: bool,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub reserves_path: PathBuf,
    pub update_interval: Duration,
    pub database_path: PathBuf,
    pub tuners: Vec<TunerDevice>,
    pub mirakurun_url: String,
    pub recorder: RecorderSettings,
    pub encode: EncodeSettings,
    pub logging: LoggingSettings,
    pub webhook: Option<WebhookSection>,
}

/// Read and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> Result<ConfigFile, ConfigError> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Explicit path first, then [`DEFAULT_CONFIG_FILE`] if it exists.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    })
}

impl Config {
    /// Load the config file named by `args` (or auto-detected) and merge.
    pub fn load(args: &Args) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = config_path(args.config.as_deref());
        let file = match &path {
            Some(path) => load_config(path)?,
            None => ConfigFile::default(),
        };
        Ok((Self::merge(args, file)?, path))
    }

    /// Merge command line arguments over a parsed config file.
    pub fn merge(args: &Args, file: ConfigFile) -> Result<Self, ConfigError> {
        let rec = file.recording;
        let defaults = RecorderSettings::default();
        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };

        let recorder = RecorderSettings {
            directory: rec.directory.unwrap_or(defaults.directory),
            file_extension: rec
                .file_extension
                .map(|ext| normalize_extension(&ext))
                .unwrap_or(defaults.file_extension),
            normal_priority: rec.normal_priority.unwrap_or(defaults.normal_priority),
            conflict_priority: rec.conflict_priority.unwrap_or(defaults.conflict_priority),
            check_interval: secs(rec.check_interval_secs, defaults.check_interval),
            pre_roll: secs(rec.pre_roll_secs, defaults.pre_roll),
            prep_retry_count: rec.prep_retry_count.unwrap_or(defaults.prep_retry_count),
            prep_retry_delay: secs(rec.prep_retry_delay_secs, defaults.prep_retry_delay),
            first_byte_timeout: secs(rec.first_byte_timeout_secs, defaults.first_byte_timeout),
            encode_priority: file.encode.priority.unwrap_or(defaults.encode_priority),
        };
        if recorder.prep_retry_count == 0 {
            return Err(ConfigError::Invalid(
                "recording.prep_retry_count must be at least 1".into(),
            ));
        }
        if recorder.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "recording.check_interval_secs must be at least 1".into(),
            ));
        }

        let encode = EncodeSettings {
            max_slots: file.encode.max_slots.unwrap_or(1),
            directory: file.encode.directory,
            preempt_timeout: secs(
                file.encode.preempt_timeout_secs,
                crate::encode::pool::DEFAULT_PREEMPT_TIMEOUT,
            ),
            error_grace: file
                .encode
                .error_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(crate::encode::manager::DEFAULT_ERROR_GRACE),
            modes: file.encode.modes,
        };
        if encode.max_slots == 0 {
            return Err(ConfigError::Invalid("encode.max_slots must be at least 1".into()));
        }
        for (i, mode) in encode.modes.iter().enumerate() {
            if encode.modes[..i].iter().any(|m| m.name == mode.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate encode mode: {}",
                    mode.name
                )));
            }
            if !(mode.rate.is_finite() && mode.rate > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "encode mode {} needs a finite positive rate",
                    mode.name
                )));
            }
        }

        let tuners = if file.tuners.is_empty() {
            vec![TunerDevice::universal("default")]
        } else {
            file.tuners
        };

        let update_interval = Duration::from_secs(
            file.reserves
                .update_interval_secs
                .unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS)
                .max(1),
        );

        Ok(Self {
            reserves_path: args
                .reserves
                .clone()
                .or(file.reserves.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESERVES_PATH)),
            update_interval,
            database_path: args
                .database
                .clone()
                .or(file.database.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            tuners,
            mirakurun_url: file
                .mirakurun
                .url
                .unwrap_or_else(|| DEFAULT_MIRAKURUN_URL.to_string()),
            recorder,
            encode,
            logging: LoggingSettings {
                log_dir: args
                    .log_dir
                    .clone()
                    .or(file.logging.log_dir)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
                retention_days: args
                    .log_retention_days
                    .or(file.logging.retention_days)
                    .unwrap_or(DEFAULT_RETENTION_DAYS),
                level: file.logging.level,
                verbose: args.verbose,
            },
            webhook: file.webhook,
        })
    }
}

fn normalize_extension(ext: &str) -> String {
    if ext.is_empty() || ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{}", ext)
    }
}
