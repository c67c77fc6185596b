//! Application configuration: TOML file defaults merged under CLI flags.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cli::RunArgs;
use mirror_core::download::{
    DEFAULT_DOWNLOAD_CAPACITY, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RECORD_ERRORS,
    DEFAULT_MAX_TASK_RETRIES,
};
use mirror_core::DatabaseOptions;

/// TOML-backed file configuration; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Catalog database path.
    pub database: Option<PathBuf>,
    /// Final download directory.
    pub download_dir: Option<PathBuf>,
    /// Staging directory for in-progress files.
    pub staging_dir: Option<PathBuf>,
    /// Directory for engine logs.
    pub log_dir: Option<PathBuf>,
    /// aria2c executable.
    pub engine: Option<PathBuf>,
    /// Active-set capacity (same range as CLI).
    pub concurrency: Option<u8>,
    /// Submissions per window (same range as CLI).
    pub request_limit: Option<u16>,
    /// Resubmissions per task before a record is marked `error`.
    pub max_task_retries: Option<u32>,
    /// Runs after which an `error` record stops being retried.
    pub max_record_errors: Option<i64>,
    /// Reconciliation tick in milliseconds.
    pub tick_interval_ms: Option<u64>,
    /// Service-mode pause after an idle pass, in seconds.
    pub idle_interval_secs: Option<u64>,
    /// Proxy handed to the engine.
    pub proxy: Option<String>,
    /// User agent override for downloads.
    pub user_agent: Option<String>,
    /// Database pool max connections (1..=20).
    pub db_max_connections: Option<u32>,
    /// Database busy timeout in milliseconds.
    pub db_busy_timeout_ms: Option<u32>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(1..=100).contains(&concurrency)
        {
            bail!("Invalid config value for `concurrency`: {concurrency}. Expected range: 1..=100");
        }
        if let Some(limit) = self.request_limit
            && !(1..=1000).contains(&limit)
        {
            bail!("Invalid config value for `request_limit`: {limit}. Expected range: 1..=1000");
        }
        if let Some(retries) = self.max_task_retries
            && retries > 20
        {
            bail!("Invalid config value for `max_task_retries`: {retries}. Expected range: 0..=20");
        }
        if let Some(errors) = self.max_record_errors
            && !(1..=100).contains(&errors)
        {
            bail!("Invalid config value for `max_record_errors`: {errors}. Expected range: 1..=100");
        }
        if let Some(tick) = self.tick_interval_ms
            && !(10..=60_000).contains(&tick)
        {
            bail!("Invalid config value for `tick_interval_ms`: {tick}. Expected range: 10..=60000");
        }
        if let Some(idle) = self.idle_interval_secs
            && !(1..=86_400).contains(&idle)
        {
            bail!("Invalid config value for `idle_interval_secs`: {idle}. Expected range: 1..=86400");
        }
        if let Some(value) = self.db_max_connections
            && !(1..=20).contains(&value)
        {
            bail!("Invalid config value for `db_max_connections`: {value}. Expected range: 1..=20");
        }
        if let Some(value) = self.db_busy_timeout_ms
            && value > 120_000
        {
            bail!("Invalid config value for `db_busy_timeout_ms`: {value}. Expected range: 0..=120000");
        }
        Ok(())
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/mirror/config.toml`
/// 2. `$HOME/.config/mirror/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("mirror").join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("mirror")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist; the default path is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match resolve_default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    let config = parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
    Ok(Some(config))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Effective settings for `mirror run` after merging CLI > file > defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub database: PathBuf,
    pub download_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub log_dir: PathBuf,
    pub engine: PathBuf,
    pub concurrency: usize,
    pub request_limit: usize,
    pub max_task_retries: u32,
    pub max_record_errors: i64,
    pub tick_interval: Duration,
    pub idle_interval: Duration,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub service: bool,
    pub db_options: DatabaseOptions,
}

/// Default catalog database path.
pub const DEFAULT_DATABASE: &str = "data/catalog.db";

impl RunSettings {
    /// Merges CLI values over file values over defaults.
    #[must_use]
    pub fn resolve(args: &RunArgs, file: Option<&FileConfig>) -> Self {
        let file = file.cloned().unwrap_or_default();
        let db_defaults = DatabaseOptions::default();

        Self {
            database: resolve_database(args.database.as_ref(), Some(&file)),
            download_dir: args
                .download_dir
                .clone()
                .or(file.download_dir)
                .unwrap_or_else(|| PathBuf::from("data/download")),
            staging_dir: args
                .staging_dir
                .clone()
                .or(file.staging_dir)
                .unwrap_or_else(|| PathBuf::from("data/staging")),
            log_dir: args
                .log_dir
                .clone()
                .or(file.log_dir)
                .unwrap_or_else(|| PathBuf::from("data")),
            engine: args
                .engine
                .clone()
                .or(file.engine)
                .unwrap_or_else(|| PathBuf::from("aria2c")),
            concurrency: args
                .concurrency
                .or(file.concurrency)
                .map_or(DEFAULT_MAX_CONCURRENT, usize::from),
            request_limit: args
                .request_limit
                .or(file.request_limit)
                .map_or(DEFAULT_DOWNLOAD_CAPACITY, usize::from),
            max_task_retries: file.max_task_retries.unwrap_or(DEFAULT_MAX_TASK_RETRIES),
            max_record_errors: file.max_record_errors.unwrap_or(DEFAULT_MAX_RECORD_ERRORS),
            tick_interval: Duration::from_millis(file.tick_interval_ms.unwrap_or(1000)),
            idle_interval: Duration::from_secs(file.idle_interval_secs.unwrap_or(30)),
            proxy: args.proxy.clone().or(file.proxy),
            user_agent: file.user_agent,
            service: args.service,
            db_options: DatabaseOptions {
                max_connections: file
                    .db_max_connections
                    .unwrap_or(db_defaults.max_connections),
                busy_timeout_ms: file
                    .db_busy_timeout_ms
                    .unwrap_or(db_defaults.busy_timeout_ms),
            },
        }
    }
}

/// Database path from CLI, then file, then default.
#[must_use]
pub fn resolve_database(cli: Option<&PathBuf>, file: Option<&FileConfig>) -> PathBuf {
    cli.cloned()
        .or_else(|| file.and_then(|f| f.database.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE))
}
