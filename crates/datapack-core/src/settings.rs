//! Environment-driven operational settings.
//!
//! Settings are read once at startup and passed by reference into the
//! components that need them; nothing here is process-global.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lock::DEFAULT_LOCK_TTL;

/// Default staging root when `DATAPACK_STAGING_ROOT` is unset.
const DEFAULT_STAGING_ROOT: &str = "/var/lib/datapack/stage";

/// Default download root when `DATAPACK_DOWNLOAD_ROOT` is unset.
const DEFAULT_DOWNLOAD_ROOT: &str = "/var/lib/datapack/download";

/// Default run expiration in days.
const DEFAULT_RUN_EXPIRATION_DAYS: u32 = 14;

/// Operational configuration for the export engine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Queue broker management API endpoint (e.g. `http://broker:15672/api`).
    pub broker_api_url: Option<String>,
    /// Root directory for per-run staging areas.
    pub staging_root: PathBuf,
    /// Root directory for published downloads.
    pub download_root: PathBuf,
    /// Whether the fleet scaler control loop is enabled.
    pub autoscale_enabled: bool,
    /// Memory ceiling per concurrent task, in megabytes.
    pub max_task_memory_mb: u64,
    /// Disk ceiling per concurrent task, in megabytes.
    pub max_task_disk_mb: u64,
    /// TTL for execution locks.
    pub lock_ttl: Duration,
    /// Days until a finished run expires and is swept.
    pub run_expiration_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker_api_url: None,
            staging_root: PathBuf::from(DEFAULT_STAGING_ROOT),
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_ROOT),
            autoscale_enabled: false,
            max_task_memory_mb: 2048,
            max_task_disk_mb: 8192,
            lock_ttl: DEFAULT_LOCK_TTL,
            run_expiration_days: DEFAULT_RUN_EXPIRATION_DAYS,
        }
    }
}

impl Settings {
    /// Loads settings from the environment, falling back to defaults.
    ///
    /// Recognized variables:
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `DATAPACK_BROKER_API_URL` | broker management API endpoint |
    /// | `DATAPACK_STAGING_ROOT` | staging root path |
    /// | `DATAPACK_DOWNLOAD_ROOT` | download root path |
    /// | `DATAPACK_AUTOSCALE` | `true`/`false` fleet scaler toggle |
    /// | `DATAPACK_MAX_TASK_MEMORY_MB` | per-task memory ceiling |
    /// | `DATAPACK_MAX_TASK_DISK_MB` | per-task disk ceiling |
    /// | `DATAPACK_LOCK_TTL_SECS` | execution lock TTL in seconds |
    /// | `DATAPACK_RUN_EXPIRATION_DAYS` | run expiration in days |
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(url) = env::var("DATAPACK_BROKER_API_URL") {
            if !url.is_empty() {
                settings.broker_api_url = Some(url);
            }
        }
        if let Ok(root) = env::var("DATAPACK_STAGING_ROOT") {
            settings.staging_root = PathBuf::from(root);
        }
        if let Ok(root) = env::var("DATAPACK_DOWNLOAD_ROOT") {
            settings.download_root = PathBuf::from(root);
        }
        if let Ok(flag) = env::var("DATAPACK_AUTOSCALE") {
            settings.autoscale_enabled = matches!(flag.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(mb) = parse_var("DATAPACK_MAX_TASK_MEMORY_MB")? {
            settings.max_task_memory_mb = mb;
        }
        if let Some(mb) = parse_var("DATAPACK_MAX_TASK_DISK_MB")? {
            settings.max_task_disk_mb = mb;
        }
        if let Some(secs) = parse_var("DATAPACK_LOCK_TTL_SECS")? {
            settings.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(days) = parse_var("DATAPACK_RUN_EXPIRATION_DAYS")? {
            settings.run_expiration_days = u32::try_from(days).map_err(|_| {
                Error::Configuration {
                    message: "DATAPACK_RUN_EXPIRATION_DAYS out of range".into(),
                }
            })?;
        }

        Ok(settings)
    }
}

fn parse_var(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Configuration {
                message: format!("{name}={value} is not a valid integer: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::default();
        assert!(settings.broker_api_url.is_none());
        assert!(!settings.autoscale_enabled);
        assert_eq!(settings.lock_ttl, DEFAULT_LOCK_TTL);
        assert_eq!(settings.run_expiration_days, 14);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        env::set_var("DATAPACK_TEST_GARBAGE", "not-a-number");
        let result = parse_var("DATAPACK_TEST_GARBAGE");
        env::remove_var("DATAPACK_TEST_GARBAGE");
        assert!(result.is_err());
    }
}
