use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the miner
#[derive(Debug, Error)]
pub enum MinerError {
    /// A table could not be loaded (malformed header, ragged rows, read failure)
    #[error("Failed to load table {table}: {message}")]
    Load {
        table: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A candidate kept failing evaluation after all retries
    #[error("Evaluation of {pair} failed after {attempts} attempts: {message}")]
    Evaluation {
        pair: String,
        attempts: u32,
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Channel/messaging errors
    #[error("Channel error: {channel} - {message}")]
    Channel {
        channel: String,
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: HashMap<String, String>,
    },
}

impl MinerError {
    /// Create a load error for a table
    pub fn load<T: Into<String>, M: Into<String>>(table: T, message: M) -> Self {
        Self::Load {
            table: table.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a load error wrapping the underlying cause
    pub fn load_with_source<T, M, E>(table: T, message: M, source: E) -> Self
    where
        T: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Load {
            table: table.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn evaluation<P: ToString, M: Into<String>>(pair: &P, attempts: u32, message: M) -> Self {
        Self::Evaluation {
            pair: pair.to_string(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to an internal error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Internal { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// Check if error is recoverable.
    ///
    /// Everything that reaches the caller of a run is fatal for that run; this
    /// tells callers whether retrying the whole run could help.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Channel { .. } | Self::Io { .. } => true,
            Self::Load { .. } | Self::Evaluation { .. } | Self::Configuration { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Evaluation { .. } => "evaluation",
            Self::Configuration { .. } => "configuration",
            Self::Channel { .. } => "channel",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MinerError>;

impl From<std::io::Error> for MinerError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for MinerError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for MinerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<csv::Error> for MinerError {
    fn from(err: csv::Error) -> Self {
        Self::serialization("csv", err)
    }
}

impl From<anyhow::Error> for MinerError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string()).with_context("source", "anyhow")
    }
}
