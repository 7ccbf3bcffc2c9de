//! Media error types.

use thiserror::Error;

/// Result type for encoder operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while invoking an encoder. Failures and
/// timeouts are retryable up to the broker's retry budget, after which
/// they become the job's terminal error detail.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{program} not found in PATH")]
    BinaryNotFound { program: String },

    #[error("{program} failed with exit code {exit_code:?}: {stderr}")]
    EncodeFailed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {seconds} seconds")]
    Timeout { program: String, seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn binary_not_found(program: impl Into<String>) -> Self {
        Self::BinaryNotFound {
            program: program.into(),
        }
    }

    pub fn encode_failed(
        program: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::EncodeFailed {
            program: program.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }
}
