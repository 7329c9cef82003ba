//! Error taxonomy for the synthesis pipeline.
//!
//! Errors are classified by *kind*, not by type: the segment worker retries
//! transient kinds, the task engine records the kind of the first failing
//! segment, and the gateway maps kinds to HTTP statuses. Provider status
//! codes are split into transient and fatal against a configurable set
//! because the provider does not document the full enumeration.

use thiserror::Error;

/// Coarse error classification recorded on failed tasks and used for
/// retry and HTTP-status decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-supplied input was unusable (empty, unknown speaker, oversized).
    Input,
    /// Provider hiccup worth retrying: timeout, truncation, retryable code.
    TransientProvider,
    /// Provider rejected the request for good: auth, quota, bad voice.
    FatalProvider,
    /// Blob put or relational write failed.
    Storage,
    /// Everything unexpected.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::TransientProvider => "transient_provider",
            Self::FatalProvider => "fatal_provider",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "input" => Self::Input,
            "transient_provider" => Self::TransientProvider,
            "fatal_provider" => Self::FatalProvider,
            "storage" => Self::Storage,
            _ => Self::Internal,
        }
    }

    /// HTTP status the gateway reports for a task that failed with this kind.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Input => 400,
            Self::TransientProvider => 503,
            Self::FatalProvider | Self::Storage | Self::Internal => 500,
        }
    }
}

/// Error type shared by the parser, provider session, workers, engine,
/// monitor, and storage collaborators.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("empty input: no dialogue turns parsed")]
    EmptyInput,

    #[error("speaker `{0}` has no voice mapping")]
    InvalidSpeaker(String),

    #[error("text is {chars} chars, exceeds limit of {limit}")]
    OversizedText { chars: usize, limit: usize },

    /// One of the provider session timeouts fired. The payload names which
    /// budget was exhausted ("connect", "idle", "total").
    #[error("provider session timed out ({0})")]
    Timeout(&'static str),

    #[error("provider stream closed before final status")]
    Truncated,

    /// Provider answered with a non-final status code.
    #[error("provider error {code}: {message}")]
    Provider { code: i32, message: String },

    /// The provider sent bytes we could not decode as a frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The worker was cancelled because a batch peer failed.
    #[error("segment cancelled")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SynthError {
    /// Classify this error. `transient_codes` is the configured set of
    /// provider status codes treated as retryable; all other provider
    /// codes are fatal.
    pub fn kind(&self, transient_codes: &[i32]) -> ErrorKind {
        match self {
            Self::EmptyInput | Self::InvalidSpeaker(_) | Self::OversizedText { .. } => {
                ErrorKind::Input
            }
            Self::Timeout(_) | Self::Truncated => ErrorKind::TransientProvider,
            Self::Provider { code, .. } => {
                if transient_codes.contains(code) {
                    ErrorKind::TransientProvider
                } else {
                    ErrorKind::FatalProvider
                }
            }
            Self::Protocol(_) => ErrorKind::FatalProvider,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cancelled | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the segment worker should retry after this error.
    pub fn is_transient(&self, transient_codes: &[i32]) -> bool {
        self.kind(transient_codes) == ErrorKind::TransientProvider
    }
}

impl From<rusqlite::Error> for SynthError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for SynthError {
    fn from(e: reqwest::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redis::RedisError> for SynthError {
    fn from(e: redis::RedisError) -> Self {
        Self::Internal(format!("shared store: {e}"))
    }
}

impl From<serde_json::Error> for SynthError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {e}"))
    }
}
