//! Typed configuration for the coordination services.
//!
//! Loads once at startup from environment variables or a TOML file, falling
//! back to defaults for anything not given. Unparsable values fail fast.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::audit::AuditConfig;
use crate::engine::DispatchConfig;
use crate::error::{Error, Result};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTOR_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENT_CONNECTORS: usize = 10;
pub const DEFAULT_RESET_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    /// Default wait for `EntityLockService::lock_with_default_timeout`.
    pub lock_timeout: Duration,
    /// Initial connector deadline. Can be changed at runtime on the executor.
    pub connector_timeout: Duration,
    pub max_concurrent_connectors: usize,
    pub audit: AuditConfig,
    /// Page size used when resetting failed connectors.
    pub reset_page_size: usize,
    pub dispatch: DispatchConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            connector_timeout: DEFAULT_CONNECTOR_TIMEOUT,
            max_concurrent_connectors: DEFAULT_MAX_CONCURRENT_CONNECTORS,
            audit: AuditConfig::default(),
            reset_page_size: DEFAULT_RESET_PAGE_SIZE,
            dispatch: DispatchConfig::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = optional_var::<u64>("FLOWCOORD_LOCK_TIMEOUT_SECS")? {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_var::<u64>("FLOWCOORD_CONNECTOR_TIMEOUT_SECS")? {
            config.connector_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = optional_var("FLOWCOORD_MAX_CONCURRENT_CONNECTORS")? {
            config.max_concurrent_connectors = n;
        }
        if let Some(n) = optional_var("FLOWCOORD_AUDIT_EXECUTIONS_THRESHOLD")? {
            config.audit.executions_threshold = n;
        }
        if let Some(secs) = optional_var("FLOWCOORD_AUDIT_EXECUTIONS_DURATION_SECS")? {
            config.audit.executions_duration =
                audit_seconds("FLOWCOORD_AUDIT_EXECUTIONS_DURATION_SECS", secs)?;
        }
        if let Some(secs) = optional_var("FLOWCOORD_AUDIT_ELAPSED_DURATION_SECS")? {
            config.audit.elapsed_duration =
                audit_seconds("FLOWCOORD_AUDIT_ELAPSED_DURATION_SECS", secs)?;
        }
        if let Some(n) = optional_var("FLOWCOORD_RESET_PAGE_SIZE")? {
            config.reset_page_size = n;
        }
        if let Some(n) = optional_var("FLOWCOORD_DISPATCH_MAX_CONCURRENT")? {
            config.dispatch.max_concurrent = n;
        }
        if let Some(n) = optional_var("FLOWCOORD_DISPATCH_MAX_ATTEMPTS")? {
            config.dispatch.max_attempts = n;
        }
        config.otel_endpoint = std::env::var("OTEL_ENDPOINT").ok();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values that would make a service misbehave silently.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(Error::Config("lock timeout must be positive".to_string()));
        }
        if self.connector_timeout.is_zero() {
            return Err(Error::Config("connector timeout must be positive".to_string()));
        }
        if self.max_concurrent_connectors == 0 {
            return Err(Error::Config(
                "max concurrent connectors must be positive".to_string(),
            ));
        }
        if self.reset_page_size == 0 {
            return Err(Error::Config("reset page size must be positive".to_string()));
        }
        if self.dispatch.max_concurrent == 0 || self.dispatch.max_attempts == 0 {
            return Err(Error::Config(
                "dispatch concurrency and attempts must be positive".to_string(),
            ));
        }
        self.audit.validate()
    }
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Audit windows are chrono durations, which top out well below `i64::MAX`
/// seconds.
fn audit_seconds(name: &str, secs: i64) -> Result<chrono::Duration> {
    chrono::TimeDelta::try_seconds(secs)
        .ok_or_else(|| Error::Config(format!("{name}={secs} is out of range")))
}

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    lock_timeout_secs: Option<u64>,
    connector_timeout_secs: Option<u64>,
    max_concurrent_connectors: Option<usize>,
    reset_page_size: Option<usize>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
    audit: FileAuditConfig,
    dispatch: FileDispatchConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileAuditConfig {
    executions_threshold: Option<u32>,
    executions_duration_secs: Option<i64>,
    elapsed_duration_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileDispatchConfig {
    max_concurrent: Option<usize>,
    max_attempts: Option<u32>,
}

impl FileConfig {
    fn into_config(self) -> Result<Config> {
        let defaults = Config::default();
        let executions_duration = match self.audit.executions_duration_secs {
            Some(secs) => audit_seconds("audit.executions_duration_secs", secs)?,
            None => defaults.audit.executions_duration,
        };
        let elapsed_duration = match self.audit.elapsed_duration_secs {
            Some(secs) => audit_seconds("audit.elapsed_duration_secs", secs)?,
            None => defaults.audit.elapsed_duration,
        };
        Ok(Config {
            lock_timeout: self
                .lock_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
            connector_timeout: self
                .connector_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connector_timeout),
            max_concurrent_connectors: self
                .max_concurrent_connectors
                .unwrap_or(defaults.max_concurrent_connectors),
            audit: AuditConfig {
                executions_threshold: self
                    .audit
                    .executions_threshold
                    .unwrap_or(defaults.audit.executions_threshold),
                executions_duration,
                elapsed_duration,
            },
            reset_page_size: self.reset_page_size.unwrap_or(defaults.reset_page_size),
            dispatch: DispatchConfig {
                max_concurrent: self
                    .dispatch
                    .max_concurrent
                    .unwrap_or(defaults.dispatch.max_concurrent),
                max_attempts: self
                    .dispatch
                    .max_attempts
                    .unwrap_or(defaults.dispatch.max_attempts),
            },
            otel_endpoint: self.otel_endpoint,
            log_level: self.log_level.unwrap_or(defaults.log_level),
        })
    }
}
