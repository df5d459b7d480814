//! Run and write-queue configuration.
//!
//! [`FleetConfig`] is the flat surface users write down (TOML file and/or
//! `TESTFLEET_*` environment variables). The scheduler and the queue server
//! each consume a typed projection of it: [`RunConfig`] and
//! [`WriteQueueConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable prefix, e.g. `TESTFLEET_WORKER_LIMIT=4`.
pub const ENV_PREFIX: &str = "TESTFLEET";

/// Default number of concurrently granted write slots.
pub const DEFAULT_MAX_WRITE_THREAD_COUNT: usize = 10;

/// Default prefix for write-queue message names.
pub const DEFAULT_MESSAGE_PREFIX: &str = "fs-store";

/// Settings for one scheduler run. Immutable for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of worker slots.
    pub worker_limit: usize,
    /// Stop dispatching on the first failed attempt.
    pub bail: bool,
    /// Extra attempts granted to a failing unit.
    pub retry_count: u32,
    /// Pause before a failed unit is queued again.
    pub retry_delay: Duration,
    /// Upper bound for one attempt; elapsed attempts count as failures.
    pub test_timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_limit: 1,
            bail: false,
            retry_count: 0,
            retry_delay: Duration::ZERO,
            test_timeout: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_limit(mut self, worker_limit: usize) -> Self {
        self.worker_limit = worker_limit;
        self
    }

    pub fn with_bail(mut self, bail: bool) -> Self {
        self.bail = bail;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_limit == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "worker_limit",
            });
        }
        Ok(())
    }
}

/// Settings for the write-access queue server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteQueueConfig {
    /// Admission capacity.
    pub max_write_thread_count: usize,
    /// Directory that generated file names are joined onto.
    pub save_path_base: PathBuf,
    /// Prefix for the message names on the shared bus.
    pub message_prefix: String,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_write_thread_count: DEFAULT_MAX_WRITE_THREAD_COUNT,
            save_path_base: PathBuf::from("screenshots"),
            message_prefix: DEFAULT_MESSAGE_PREFIX.to_string(),
        }
    }
}

impl WriteQueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_write_thread_count(mut self, count: usize) -> Self {
        self.max_write_thread_count = count;
        self
    }

    pub fn with_save_path_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path_base = path.into();
        self
    }

    pub fn with_message_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.message_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_write_thread_count == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "max_write_thread_count",
            });
        }
        Ok(())
    }
}

/// Flat configuration surface as written in files and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub worker_limit: usize,
    pub bail: bool,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_timeout_ms: Option<u64>,
    pub max_write_thread_count: usize,
    pub save_path_base: PathBuf,
    pub message_prefix: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let run = RunConfig::default();
        let queue = WriteQueueConfig::default();
        Self {
            worker_limit: run.worker_limit,
            bail: run.bail,
            retry_count: run.retry_count,
            retry_delay_ms: 0,
            test_timeout_ms: None,
            max_write_thread_count: queue.max_write_thread_count,
            save_path_base: queue.save_path_base,
            message_prefix: queue.message_prefix,
        }
    }
}

impl FleetConfig {
    /// Load from an optional TOML file, overridden by `TESTFLEET_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let config: FleetConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run_config().validate()?;
        self.write_queue_config().validate()
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            worker_limit: self.worker_limit,
            bail: self.bail,
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            test_timeout: self.test_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn write_queue_config(&self) -> WriteQueueConfig {
        WriteQueueConfig {
            max_write_thread_count: self.max_write_thread_count,
            save_path_base: self.save_path_base.clone(),
            message_prefix: self.message_prefix.clone(),
        }
    }
}
