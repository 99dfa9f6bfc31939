use thiserror::Error;

/// Canonical error type for run configuration and domain parsing.
///
/// Every variant here is fatal for a run: it is raised before any traffic is
/// sent and never produced by an individual request.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Run configuration is missing a required value or holds an invalid one.
    #[error("invalid configuration: {message}")]
    Config {
        /// Human-readable description of the offending setting.
        message: String,
    },

    /// A threshold expression could not be parsed.
    #[error("invalid threshold `{expression}`: {message}")]
    InvalidThreshold {
        /// The expression as written in configuration.
        expression: String,
        /// What was wrong with it.
        message: String,
    },

    /// A human duration string (e.g. `"1m30s"`) could not be parsed.
    #[error("invalid duration `{input}`: {message}")]
    InvalidDuration {
        /// The string as written in configuration.
        input: String,
        /// Parser diagnostic.
        message: String,
    },

    /// I/O error occurred while reading configuration or writing a report.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Creates a `Config` variant.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an `InvalidThreshold` variant.
    #[must_use]
    pub fn invalid_threshold(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors that mean the run configuration is unusable.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::InvalidThreshold { .. } | Self::InvalidDuration { .. }
        )
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_classified() {
        assert!(CoreError::config("base_url is required").is_config());
        assert!(CoreError::invalid_threshold("p95 <", "missing value").is_config());
        assert!(!CoreError::Serialization("boom".to_string()).is_config());
    }

    #[test]
    fn test_display_includes_expression() {
        let err = CoreError::invalid_threshold("latency ~ 3", "unknown operator");
        assert_eq!(
            err.to_string(),
            "invalid threshold `latency ~ 3`: unknown operator"
        );
    }
}
