//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_CACHE_ROOT, DEFAULT_MAX_BODY_BYTES, DEFAULT_STREAM_THRESHOLD_BYTES, RuleError,
    RuleRegistry,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tiercache";

/// Command-line arguments for the tiercache maintenance binary.
#[derive(Debug, Parser)]
#[command(name = "tiercache", version, about = "HTTP response cache maintenance")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TIERCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Delete cached bodies (and legacy cache files) whose key starts with a prefix.
    Purge(PurgeArgs),
    /// Show which cache rule, if any, applies to a request path.
    #[command(name = "match")]
    Match(MatchArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct PurgeArgs {
    /// Key prefix to purge; everything when omitted.
    #[arg(long, default_value = "")]
    pub prefix: String,
}

#[derive(Debug, Args, Clone)]
pub struct MatchArgs {
    /// Request path to evaluate, without query string.
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the cache root directory.
    #[arg(long = "cache-root", global = true, value_name = "PATH")]
    pub cache_root: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        global = true,
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
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
    pub root: PathBuf,
    pub stream_threshold_bytes: NonZeroU64,
    /// Largest body buffered for keying or storing.
    pub max_body_bytes: NonZeroUsize,
    /// Rules in priority order.
    pub rules: Vec<RuleSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSettings {
    pub pattern: String,
    pub content_type: String,
    pub ttl: Option<Duration>,
}

impl CacheSettings {
    /// Compile the configured rules, keeping their order.
    pub fn rule_registry(&self) -> Result<RuleRegistry, RuleError> {
        let mut registry = RuleRegistry::new();
        for rule in &self.rules {
            registry.add_rule(&rule.pattern, rule.content_type.clone(), rule.ttl)?;
        }
        Ok(registry)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
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

    builder = builder.add_source(Environment::with_prefix("TIERCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(root) = overrides.cache_root.as_ref() {
            self.cache.root = Some(root.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
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
    let root = cache
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.root", "path must not be empty"));
    }

    let threshold = cache
        .stream_threshold_bytes
        .unwrap_or(DEFAULT_STREAM_THRESHOLD_BYTES);
    let stream_threshold_bytes = NonZeroU64::new(threshold).ok_or_else(|| {
        LoadError::invalid("cache.stream_threshold_bytes", "must be greater than zero")
    })?;

    let max_body = cache.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
    let max_body_bytes = NonZeroUsize::new(max_body).ok_or_else(|| {
        LoadError::invalid("cache.max_body_bytes", "must be greater than zero")
    })?;

    let rules = cache
        .rules
        .into_iter()
        .enumerate()
        .map(|(position, rule)| build_rule_settings(position, rule))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        root,
        stream_threshold_bytes,
        max_body_bytes,
        rules,
    })
}

fn build_rule_settings(position: usize, rule: RawRuleSettings) -> Result<RuleSettings, LoadError> {
    let pattern = rule.pattern.unwrap_or_default();
    if pattern.trim().is_empty() {
        return Err(LoadError::invalid(
            format!("cache.rules[{position}].pattern"),
            "pattern must not be empty",
        ));
    }

    let content_type = rule.content_type.unwrap_or_default().trim().to_string();
    if content_type.is_empty() {
        return Err(LoadError::invalid(
            format!("cache.rules[{position}].content_type"),
            "content type must not be empty",
        ));
    }

    Ok(RuleSettings {
        pattern,
        content_type,
        ttl: rule.ttl_seconds.map(Duration::from_secs),
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
    root: Option<PathBuf>,
    stream_threshold_bytes: Option<u64>,
    max_body_bytes: Option<usize>,
    rules: Vec<RawRuleSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRuleSettings {
    pattern: Option<String>,
    content_type: Option<String>,
    ttl_seconds: Option<u64>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
