//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagcache";
const ENV_PREFIX: &str = "TAGCACHE";
const DEFAULT_VERSION: u64 = 1;
const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_GRID_TTL_SECONDS: u64 = 1800;
const DEFAULT_OUTPUT_TTL_SECONDS: u64 = 3600;
const DEFAULT_EVENT_QUEUE_LIMIT: u64 = 1024;
const DEFAULT_CONSUME_BATCH_LIMIT: u64 = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5000;
const DEFAULT_BACKING_DIR: &str = "cache-data";

/// Command-line arguments for the tagcache binary.
#[derive(Debug, Parser)]
#[command(name = "tagcache", version, about = "Tag-indexed invalidation cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a JSON script of cache operations and print one result per step.
    Replay(ReplayArgs),
    /// Publish JSON-lines events and let the background consumer apply them.
    Events(EventsArgs),
    /// Print the cache key built from a kind, identity and settings.
    Key(KeyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Script to run.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct EventsArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// File holding one JSON event per line.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Replay script run before publishing; supplies the term hierarchy and
    /// the entries the events act on.
    #[arg(long, value_name = "SCRIPT", value_hint = ValueHint::FilePath)]
    pub seed: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Key kind, e.g. `grid` or `output`.
    #[arg(long, value_name = "KIND")]
    pub kind: String,

    /// Logical identity such as a grid slug.
    #[arg(long, value_name = "IDENTITY")]
    pub identity: String,

    /// A `name=value` setting; may be repeated.
    #[arg(long = "setting", value_name = "NAME=VALUE")]
    pub settings: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Enable or bypass the cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the version stamp embedded in keys.
    #[arg(long = "cache-version", value_name = "VERSION")]
    pub cache_version: Option<u64>,

    /// Override the interval between background consumption passes.
    #[arg(long = "cache-auto-consume-interval-ms", value_name = "MILLIS")]
    pub auto_consume_interval_ms: Option<u64>,

    /// Enable or disable the on-disk tier.
    #[arg(
        long = "backing-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub backing_enabled: Option<bool>,

    /// Override the on-disk tier directory.
    #[arg(long = "backing-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub backing_directory: Option<PathBuf>,
}

impl Command {
    pub fn overrides(&self) -> &CacheOverrides {
        match self {
            Self::Replay(args) => &args.overrides,
            Self::Events(args) => &args.overrides,
            Self::Key(args) => &args.overrides,
        }
    }
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub backing: BackingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub version: u64,
    pub default_ttl: Duration,
    pub grid_ttl: Duration,
    pub output_ttl: Duration,
    pub event_queue_limit: NonZeroUsize,
    pub consume_batch_limit: NonZeroUsize,
    pub auto_consume_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BackingSettings {
    pub enabled: bool,
    pub directory: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(cli.command.overrides());

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    backing: RawBackingSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(version) = overrides.cache_version {
            self.cache.version = Some(version);
        }
        if let Some(millis) = overrides.auto_consume_interval_ms {
            self.cache.auto_consume_interval_ms = Some(millis);
        }
        if let Some(enabled) = overrides.backing_enabled {
            self.backing.enabled = Some(enabled);
        }
        if let Some(dir) = overrides.backing_directory.as_ref() {
            self.backing.directory = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            backing,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let backing = build_backing_settings(backing)?;

        Ok(Self {
            logging,
            cache,
            backing,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_ttl = non_zero_seconds(
        cache.default_ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS),
        "cache.default_ttl_seconds",
    )?;
    let grid_ttl = non_zero_seconds(
        cache.grid_ttl_seconds.unwrap_or(DEFAULT_GRID_TTL_SECONDS),
        "cache.grid_ttl_seconds",
    )?;
    let output_ttl = non_zero_seconds(
        cache.output_ttl_seconds.unwrap_or(DEFAULT_OUTPUT_TTL_SECONDS),
        "cache.output_ttl_seconds",
    )?;
    let event_queue_limit = non_zero_usize(
        cache.event_queue_limit.unwrap_or(DEFAULT_EVENT_QUEUE_LIMIT),
        "cache.event_queue_limit",
    )?;
    let consume_batch_limit = non_zero_usize(
        cache
            .consume_batch_limit
            .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT),
        "cache.consume_batch_limit",
    )?;

    let interval_ms = cache
        .auto_consume_interval_ms
        .unwrap_or(DEFAULT_AUTO_CONSUME_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.auto_consume_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        version: cache.version.unwrap_or(DEFAULT_VERSION),
        default_ttl,
        grid_ttl,
        output_ttl,
        event_queue_limit,
        consume_batch_limit,
        auto_consume_interval: Duration::from_millis(interval_ms),
    })
}

fn build_backing_settings(backing: RawBackingSettings) -> Result<BackingSettings, LoadError> {
    let directory = backing
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKING_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "backing.directory",
            "directory path cannot be empty",
        ));
    }

    Ok(BackingSettings {
        enabled: backing.enabled.unwrap_or(false),
        directory,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    version: Option<u64>,
    default_ttl_seconds: Option<u64>,
    grid_ttl_seconds: Option<u64>,
    output_ttl_seconds: Option<u64>,
    event_queue_limit: Option<u64>,
    consume_batch_limit: Option<u64>,
    auto_consume_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackingSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
}

fn non_zero_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
