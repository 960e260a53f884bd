//! Server configuration, read from a TOML file with a single
//! `[server]` table:
//!
//! ```toml
//! [server]
//! max-files = 100
//! max-storage = 1048576
//! num-workers = 4
//! socket-filepath = "/tmp/sol.sock"
//! cache-eviction-policy = "fifo"
//! ```
//!
//! The configuration is validated once, when loaded, and is immutable
//! afterwards.
use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::eviction::EvictionPolicy;
use crate::framer::DEFAULT_MAX_MESSAGE_LEN;

pub const MAX_WORKERS: usize = 32;

/// Upper bound on the default bucket count.  Explicit `buckets`
/// settings may go higher.
pub const DEFAULT_MAX_BUCKETS: u64 = 4096;

/// How long a worker waits on a client that doesn't read its
/// responses before hanging up on it.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {}", path.display(), source)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the receiver assigns requests to workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerSelection {
    /// Every request from a connection goes to the same worker, so
    /// requests are handled in the order they were sent.
    #[default]
    Sticky,
    /// Each request goes to a uniformly chosen worker.
    Random,
}

fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_LEN
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub max_files: u64,
    /// Byte budget for the contents of all files.
    pub max_storage: u64,
    pub num_workers: usize,
    pub socket_filepath: PathBuf,
    pub cache_eviction_policy: EvictionPolicy,
    #[serde(default)]
    pub log_filepath: Option<PathBuf>,
    #[serde(default)]
    pub buckets: Option<usize>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
    #[serde(default)]
    pub worker_selection: WorkerSelection,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    server: Config,
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        Config::from_toml_str(&text)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml_str(text: &str) -> Result<Config, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;

        file.server.validate()?;
        Ok(file.server)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_owned()));

        if self.max_files == 0 {
            return invalid("max-files must be positive");
        }

        if self.max_storage == 0 {
            return invalid("max-storage must be positive");
        }

        if self.num_workers == 0 || self.num_workers > MAX_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "num-workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.num_workers
            )));
        }

        if self.socket_filepath.as_os_str().is_empty() {
            return invalid("socket-filepath must not be empty");
        }

        if self.buckets == Some(0) {
            return invalid("buckets must be positive");
        }

        if self.max_message_size == 0 {
            return invalid("max-message-size must be positive");
        }

        if self.write_timeout_ms == 0 {
            return invalid("write-timeout-ms must be positive");
        }

        Ok(())
    }

    /// Returns the longest a response write may block.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Returns the number of buckets for the storage table: the
    /// explicit setting, or roughly one bucket per file.
    pub fn bucket_count(&self) -> usize {
        match self.buckets {
            Some(count) => count,
            None => self.max_files.min(DEFAULT_MAX_BUCKETS) as usize,
        }
    }
}
