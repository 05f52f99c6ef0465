//! Endpoint configuration.
//!
//! Options load in three layers: built-in defaults, then an optional TOML
//! file (either flat or under a `[broker]` table), then `BROKER_*`
//! environment overrides (`BROKER_RECORDING_DIRECTORY`, `BROKER_FORWARD`,
//! ...). `BROKER_DEBUG_*` variables belong to [`crate::telemetry`] and are
//! not configuration keys.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use tracing::debug;

/// Options governing one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Initial hop budget for published node messages. Clamped to at least 1.
    pub ttl: u16,

    /// Whether this endpoint forwards publications it is not the last
    /// receiver of. Leaf endpoints can disable this.
    pub forward: bool,

    /// Directory receiving `messages.dat`, a record of every forwarded node
    /// message. Empty disables recording.
    pub recording_directory: String,

    /// Maximum number of node messages appended to the recording file.
    pub output_generator_file_cap: usize,

    /// Seconds to wait before re-dialing a lost peering. Unset disables
    /// automatic reconnects.
    pub peer_retry_interval: Option<f64>,

    /// Capacity of each per-peer outbound queue; a full queue marks the link
    /// congested and engages the holding map.
    pub outbound_queue_capacity: usize,

    /// Largest frame accepted from or produced for a link, in bytes.
    pub max_frame_size: usize,

    /// Seconds allowed for TCP connect plus handshake.
    pub connect_timeout: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl: 20,
            forward: true,
            recording_directory: String::new(),
            output_generator_file_cap: 100_000,
            peer_retry_interval: None,
            outbound_queue_capacity: 64,
            max_frame_size: 8 * 1024 * 1024,
            connect_timeout: 10.0,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file, and environment
    /// overrides.
    ///
    /// # Errors
    /// Returns a configuration error if the file cannot be read or any layer
    /// fails to parse or validate.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut table = match toml::Value::try_from(Self::default()) {
            Ok(toml::Value::Table(table)) => table,
            _ => return Err(Error::configuration("default configuration is not a table")),
        };

        if let Some(path) = file {
            let text = fs::read_to_string(path)
                .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))?;
            let parsed: toml::Value = toml::from_str(&text)
                .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))?;
            // Accept options either flat or under a [broker] table.
            let source = match parsed {
                toml::Value::Table(mut root) => match root.remove("broker") {
                    Some(toml::Value::Table(section)) => section,
                    Some(_) => {
                        return Err(Error::configuration("'broker' must be a table"));
                    },
                    None => root,
                },
                _ => return Err(Error::configuration("configuration root must be a table")),
            };
            for (key, value) in source {
                table.insert(key, value);
            }
            debug!(path = %path.display(), "loaded configuration file");
        }

        for (key, raw) in env::vars() {
            let Some(suffix) = key.strip_prefix("BROKER_") else { continue };
            if suffix.starts_with("DEBUG_") || suffix.is_empty() {
                continue;
            }
            let key = suffix.to_ascii_lowercase().replace('_', "-");
            let value = raw.parse::<toml::Value>().unwrap_or(toml::Value::String(raw));
            table.insert(key, value);
        }

        let config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate option values.
    ///
    /// # Errors
    /// Returns a configuration error on out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue_capacity == 0 {
            return Err(Error::configuration("outbound-queue-capacity must be greater than 0"));
        }
        if self.max_frame_size < 1024 {
            return Err(Error::configuration("max-frame-size must be at least 1024 bytes"));
        }
        if self.connect_timeout <= 0.0 {
            return Err(Error::configuration("connect-timeout must be positive"));
        }
        if self.peer_retry_interval.is_some_and(|secs| secs <= 0.0) {
            return Err(Error::configuration("peer-retry-interval must be positive"));
        }
        Ok(())
    }

    /// The initial TTL, clamped to the protocol minimum of 1.
    pub fn initial_ttl(&self) -> u16 {
        self.ttl.max(1)
    }

    /// Reconnect interval as a [`Duration`], if configured.
    pub fn retry_interval(&self) -> Option<Duration> {
        self.peer_retry_interval.map(Duration::from_secs_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_ttl(), 20);
        assert!(config.forward);
        assert!(config.retry_interval().is_none());
    }

    #[test]
    fn test_ttl_clamps_to_one() {
        let config = Config { ttl: 0, ..Config::default() };
        assert_eq!(config.initial_ttl(), 1);
    }

    #[test]
    fn test_load_from_broker_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[broker]\nttl = 7\nrecording-directory = \"/tmp/rec\"\nforward = false"
        )
        .unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.ttl, 7);
        assert_eq!(config.recording_directory, "/tmp/rec");
        assert!(!config.forward);
        // Untouched keys keep their defaults.
        assert_eq!(config.max_frame_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "output-generator-file-cap = 10").unwrap();
        env::set_var("BROKER_OUTPUT_GENERATOR_FILE_CAP", "99");
        let config = Config::load(Some(file.path())).unwrap();
        env::remove_var("BROKER_OUTPUT_GENERATOR_FILE_CAP");
        assert_eq!(config.output_generator_file_cap, 99);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = Config { outbound_queue_capacity: 0, ..Config::default() };
        assert!(config.validate().is_err());
        let config = Config { peer_retry_interval: Some(-1.0), ..Config::default() };
        assert!(config.validate().is_err());
    }
}
