//! Environment configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const STORAGE_DIR_VAR: &str = "TERMSYNC_STORAGE_DIR";
pub const STORAGE_QUOTA_VAR: &str = "TERMSYNC_STORAGE_QUOTA_BYTES";
pub const DEBOUNCE_VAR: &str = "TERMSYNC_PERSIST_DEBOUNCE_MS";
pub const RECONNECT_TIMEOUT_VAR: &str = "TERMSYNC_RECONNECT_TIMEOUT_MS";
pub const RESYNC_INTERVAL_VAR: &str = "TERMSYNC_RESYNC_INTERVAL_MS";
pub const BUFFER_TTL_VAR: &str = "TERMSYNC_BUFFER_TTL_SECS";
pub const LOG_FILE_VAR: &str = "TERMSYNC_LOG";
pub const DEBUG_VAR: &str = "TERMSYNC_DEBUG";
pub const TRANSPORT_VAR: &str = "TERMSYNC_TRANSPORT";

pub const DEFAULT_STORAGE_DIR: &str = ".termsync";
pub const DEFAULT_TRANSPORT: &str = "mock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub storage_dir: PathBuf,
    /// `None` means unlimited.
    pub storage_quota_bytes: Option<u64>,
    pub persist_debounce: Duration,
    pub reconnect_timeout: Duration,
    pub resync_interval: Duration,
    pub buffer_ttl: Duration,
    pub log_file: Option<String>,
    pub debug: bool,
    pub transport: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            storage_quota_bytes: None,
            persist_debounce: Duration::from_millis(300),
            reconnect_timeout: Duration::from_millis(5000),
            resync_interval: Duration::from_millis(2000),
            buffer_ttl: Duration::from_secs(24 * 60 * 60),
            log_file: None,
            debug: false,
            transport: DEFAULT_TRANSPORT.to_string(),
        }
    }
}

impl SyncConfig {
    /// Reads `TERMSYNC_*` variables. Unset, blank or invalid values keep defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_dir: env_string_opt(STORAGE_DIR_VAR)
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            storage_quota_bytes: env_u64(STORAGE_QUOTA_VAR).filter(|quota| *quota > 0),
            persist_debounce: env_u64(DEBOUNCE_VAR)
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_debounce),
            reconnect_timeout: env_u64(RECONNECT_TIMEOUT_VAR)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_timeout),
            resync_interval: env_u64(RESYNC_INTERVAL_VAR)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.resync_interval),
            buffer_ttl: env_u64(BUFFER_TTL_VAR)
                .map(Duration::from_secs)
                .unwrap_or(defaults.buffer_ttl),
            log_file: env_string_opt(LOG_FILE_VAR),
            debug: env_flag(DEBUG_VAR),
            transport: env_string_opt(TRANSPORT_VAR)
                .map(|value| value.trim().to_string())
                .unwrap_or(defaults.transport),
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|value| value == "1").unwrap_or(false)
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    let value = env_string_opt(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, %value, "ignoring non-numeric configuration value");
            None
        }
    }
}
