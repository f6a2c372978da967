//! Connection and host configuration.

use crate::error::{Result, SyncError};
use std::path::PathBuf;
use std::time::Duration;

/// Host endpoint URI.
pub const ENV_HOST: &str = "TABLESYNC_HOST";
/// Logical database / module name.
pub const ENV_DB_NAME: &str = "TABLESYNC_DB_NAME";
/// Path of the persisted bearer token.
pub const ENV_CREDENTIALS: &str = "TABLESYNC_CREDENTIALS";
/// Processing loop interval in milliseconds.
pub const ENV_TICK_MS: &str = "TABLESYNC_TICK_MS";
/// Address the host listens on.
pub const ENV_LISTEN: &str = "TABLESYNC_LISTEN";
/// Whether the host seeds the part catalogue on startup.
pub const ENV_SEED_PARTS: &str = "TABLESYNC_SEED_PARTS";

const DEFAULT_MODULE: &str = "quickstart-tanks";

/// Client connection parameters.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Host endpoint, e.g. `tcp://127.0.0.1:3000`.
    pub host: String,

    /// Module to connect to.
    pub module_name: String,

    /// Where the bearer token is persisted between runs.
    pub credentials_path: PathBuf,

    /// Processing loop interval.
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "tcp://127.0.0.1:3000".into(),
            module_name: DEFAULT_MODULE.into(),
            credentials_path: PathBuf::from(".tablesync/token"),
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `TABLESYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup(ENV_HOST) {
            config.host = host;
        }
        if let Some(name) = lookup(ENV_DB_NAME) {
            config.module_name = name;
        }
        if let Some(path) = lookup(ENV_CREDENTIALS) {
            config.credentials_path = PathBuf::from(path);
        }
        if let Some(ms) = lookup(ENV_TICK_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| SyncError::Config(format!("{} must be a number, got {:?}", ENV_TICK_MS, ms)))?;
            if ms == 0 {
                return Err(SyncError::Config(format!("{} must be positive", ENV_TICK_MS)));
            }
            config.tick_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// Host parameters.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub module_name: String,

    /// Listen address for the TCP server.
    pub listen_addr: String,

    /// Run the `init` reducer to seed parts on startup.
    pub seed_parts: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            module_name: DEFAULT_MODULE.into(),
            listen_addr: "127.0.0.1:3000".into(),
            seed_parts: false,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = lookup(ENV_DB_NAME) {
            config.module_name = name;
        }
        if let Some(addr) = lookup(ENV_LISTEN) {
            config.listen_addr = addr;
        }
        if let Some(flag) = lookup(ENV_SEED_PARTS) {
            config.seed_parts = parse_flag(&flag)?;
        }
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(SyncError::Config(format!(
            "{} must be a boolean, got {:?}",
            ENV_SEED_PARTS, other
        ))),
    }
}
