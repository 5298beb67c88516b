//! Error types for benchmark orchestration

use thiserror::Error;

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Return code written to `command` for parameter sanity check failures
pub const CODE_INVALID_PARAMETERS: i32 = -1;
/// Return code written to `command` for unknown test selectors
pub const CODE_UNSUPPORTED_TEST: i32 = -2;
/// Return code used for any other device side failure
pub const CODE_INTERNAL: i32 = -3;

/// Errors that can occur while setting up or running a benchmark
#[derive(Debug, Error)]
pub enum BenchError {
    /// Transfer, window or offset sanity checks failed
    #[error("Invalid test parameters: {reason}")]
    InvalidParameters {
        /// Which check failed
        reason: String,
    },

    /// Command value does not select a known test
    #[error("Unsupported test selector {command}")]
    UnsupportedTest {
        /// Raw command value
        command: i32,
    },

    /// Benchmark configuration is inconsistent
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Which setting is wrong
        reason: String,
    },

    /// Device completed a test with a negative return code
    #[error("Test {test} failed with code {code}")]
    TestFailed {
        /// Test selector that was run
        test: i32,
        /// Return code read back from `command`
        code: i32,
    },

    /// Host gave up polling for completion
    #[error("Test {test} did not complete within {duration_ms}ms")]
    Timeout {
        /// Test selector that was run
        test: i32,
        /// Poll budget in milliseconds
        duration_ms: u64,
    },

    /// Device side state is not what the orchestration expects
    #[error("Internal error: {reason}")]
    Internal {
        /// What went wrong
        reason: String,
    },

    /// Failed to spawn a worker thread
    #[error("Failed to spawn worker thread: {source}")]
    Spawn {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl BenchError {
    /// Create an invalid parameters error
    pub fn invalid_parameters(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Negative return code reported through the control channel
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameters { .. } => CODE_INVALID_PARAMETERS,
            Self::UnsupportedTest { .. } => CODE_UNSUPPORTED_TEST,
            Self::TestFailed { code, .. } => *code,
            _ => CODE_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let invalid = BenchError::invalid_parameters("too big");
        let unsupported = BenchError::UnsupportedTest { command: 42 };
        assert_eq!(invalid.code(), CODE_INVALID_PARAMETERS);
        assert_eq!(unsupported.code(), CODE_UNSUPPORTED_TEST);
        assert!(invalid.code() < 0 && unsupported.code() < 0);
        assert_ne!(invalid.code(), unsupported.code());
        assert_eq!(BenchError::config("x").code(), CODE_INTERNAL);
    }

    #[test]
    fn messages_carry_details() {
        let err = BenchError::UnsupportedTest { command: 9 };
        assert_eq!(err.to_string(), "Unsupported test selector 9");
    }
}
