use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::core::errors::{MinerError, Result};

/// Miner configuration with all tuning parameters.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    // Input configuration
    /// Table files to profile, one table per file
    pub inputs: Vec<PathBuf>,
    /// Rows delivered per input batch
    pub batch_size: usize,
    /// Field delimiter of the CSV inputs
    pub csv_delimiter: char,
    /// Whether the first CSV record is the header
    pub csv_has_headers: bool,

    /// Reserved for n-ary discovery; unary mining ignores it
    pub discover_nary: bool,

    // Retry configuration
    /// Re-dispatches allowed for a candidate whose evaluation errored
    pub max_evaluation_retries: u32,
    /// Initial retry delay
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Maximum retry delay
    #[serde(with = "duration_ms")]
    pub max_retry_delay: Duration,
    /// Retry backoff multiplier
    pub retry_backoff_multiplier: f64,

    // Scheduler configuration
    /// Tasks a single worker may hold at once; a completion frees a slot
    pub max_in_flight_per_worker: usize,
    /// How long work may wait with no live worker before the run is reported stalled
    #[serde(with = "duration_ms")]
    pub stall_timeout: Duration,
    /// Stall detection tick
    #[serde(with = "duration_ms")]
    pub stall_check_interval: Duration,
    /// Hard limit for a whole run; a fired limit aborts the run
    #[serde(with = "duration_ms_opt")]
    pub run_timeout: Option<Duration>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            batch_size: 10_000,
            csv_delimiter: ',',
            csv_has_headers: true,

            discover_nary: false,

            max_evaluation_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),
            retry_backoff_multiplier: 2.0,

            max_in_flight_per_worker: 2,
            stall_timeout: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(1),
            run_timeout: None,
        }
    }
}

impl MinerConfig {
    /// Create a new builder for MinerConfig
    pub fn builder() -> MinerConfigBuilder {
        MinerConfigBuilder::new()
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MinerError::io(format!("read config {}", path.display()), e))?;
        let config: MinerConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MinerError::configuration_field(
                "batch_size must be greater than 0",
                "batch_size",
            ));
        }
        if !self.csv_delimiter.is_ascii() {
            return Err(MinerError::configuration_field(
                "csv_delimiter must be a single ASCII character",
                "csv_delimiter",
            ));
        }

        if self.retry_backoff_multiplier < 1.0 {
            return Err(MinerError::configuration_field(
                "retry_backoff_multiplier must be >= 1.0",
                "retry_backoff_multiplier",
            ));
        }
        if self.retry_delay > self.max_retry_delay {
            return Err(MinerError::configuration_field(
                "retry_delay cannot exceed max_retry_delay",
                "retry_delay",
            ));
        }

        if self.max_in_flight_per_worker == 0 {
            return Err(MinerError::configuration_field(
                "max_in_flight_per_worker must be greater than 0",
                "max_in_flight_per_worker",
            ));
        }
        if self.stall_check_interval.is_zero() {
            return Err(MinerError::configuration_field(
                "stall_check_interval must be greater than 0",
                "stall_check_interval",
            ));
        }
        if self.stall_timeout < self.stall_check_interval {
            return Err(MinerError::configuration_field(
                "stall_timeout should be greater than stall_check_interval",
                "stall_timeout",
            ));
        }
        if let Some(limit) = self.run_timeout {
            if limit.is_zero() {
                return Err(MinerError::configuration_field(
                    "run_timeout must be greater than 0 when set",
                    "run_timeout",
                ));
            }
        }

        Ok(())
    }

    /// Backoff before the given retry attempt (1-based), jittered by up to 10%
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.retry_delay.as_secs_f64() * self.retry_backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_retry_delay.as_secs_f64());
        let jitter = capped * 0.1 * fastrand::f64();
        Duration::from_secs_f64(capped + jitter).min(self.max_retry_delay)
    }

    /// Create a configuration suited to tests: short delays, quick stall detection
    pub fn development() -> Self {
        Self {
            batch_size: 2,
            retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(50),
            stall_timeout: Duration::from_millis(200),
            stall_check_interval: Duration::from_millis(20),
            run_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }
}

/// Builder for MinerConfig
pub struct MinerConfigBuilder {
    config: MinerConfig,
}

impl MinerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: MinerConfig::default(),
        }
    }

    /// Add an input table location
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.inputs.push(path.into());
        self
    }

    /// Replace all input table locations
    pub fn inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.inputs = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn batch_size(mut self, rows: usize) -> Self {
        self.config.batch_size = rows;
        self
    }

    pub fn csv_delimiter(mut self, delimiter: char) -> Self {
        self.config.csv_delimiter = delimiter;
        self
    }

    pub fn csv_has_headers(mut self, has_headers: bool) -> Self {
        self.config.csv_has_headers = has_headers;
        self
    }

    pub fn discover_nary(mut self, enabled: bool) -> Self {
        self.config.discover_nary = enabled;
        self
    }

    /// Set retry configuration
    pub fn max_evaluation_retries(mut self, retries: u32) -> Self {
        self.config.max_evaluation_retries = retries;
        self
    }

    /// Set retry delays
    pub fn retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry_delay = initial;
        self.config.max_retry_delay = max;
        self
    }

    pub fn max_in_flight_per_worker(mut self, tasks: usize) -> Self {
        self.config.max_in_flight_per_worker = tasks;
        self
    }

    /// Set stall detection
    pub fn stall_detection(mut self, timeout: Duration, interval: Duration) -> Self {
        self.config.stall_timeout = timeout;
        self.config.stall_check_interval = interval;
        self
    }

    pub fn run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.run_timeout = timeout;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<MinerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for MinerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
