//! Server configuration, loaded from a TOML file with serde defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root directory for record stores and the watermark file.
    pub directory: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Enables test-only behavior: SIGUSR1 reset and the X-Testing-Time
    /// header. Never set in production.
    pub testing: bool,
    /// Decimal places bounding-box coordinates must be rounded to; also the
    /// spatial bucket granularity.
    pub bounding_box_minimum_dp: u32,
    /// Maximum bounding-box area in square degrees.
    pub bounding_box_maximum_size: f64,
    /// Decimal places of location resolution advertised to clients.
    pub location_resolution: u32,
    /// Retention horizon in days; older records are expired.
    pub expire_data_days: u64,
    /// Seconds between retention sweeps.
    pub retention_sweep_period_secs: u64,
    /// Result budget for one scan or sync response.
    pub max_sync_count: usize,
    /// Peer servers to replicate from.
    pub servers: Vec<String>,
    /// Seconds between replication polls.
    pub neighbor_sync_period_secs: u64,
    /// Disk read attempts before a transient failure is propagated.
    pub read_retry_attempts: usize,
    /// Recency cache capacity, in records, per store.
    pub cache_entries: usize,
    /// How many absent update tokens in a row end a seed-chain walk.
    pub max_consecutive_misses: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            port: 8080,
            testing: false,
            bounding_box_minimum_dp: 2,
            bounding_box_maximum_size: 4.0,
            location_resolution: 4,
            expire_data_days: 45,
            retention_sweep_period_secs: 3600,
            max_sync_count: 1000,
            servers: Vec::new(),
            neighbor_sync_period_secs: 60,
            read_retry_attempts: 3,
            cache_entries: 4096,
            max_consecutive_misses: 10,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Retention horizon in seconds.
    pub fn expire_after_secs(&self) -> f64 {
        self.expire_data_days as f64 * 24.0 * 60.0 * 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.bounding_box_minimum_dp, 2);
        assert_eq!(config.max_sync_count, 1000);
        assert!(!config.testing);
    }

    #[test]
    fn load_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            "directory = \"/tmp/sightings\"\nport = 9000\ntesting = true\nservers = [\"http://peer:8080\"]\n"
        )
        .expect("write");
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.port, 9000);
        assert!(config.testing);
        assert_eq!(config.servers.len(), 1);
        // untouched fields keep defaults
        assert_eq!(config.expire_data_days, 45);
    }

    #[test]
    fn unknown_fields_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "no_such_field = 1\n").expect("write");
        assert!(Config::load(file.path()).is_err());
    }
}
