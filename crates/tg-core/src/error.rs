use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;

/// Rejected generation spec. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid generation spec: {0}")]
    InvalidSpec(String),
}

/// Failure of a single outbound exchange with the generation endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP {status}: {message}")]
    Http4xx { status: u16, message: String },

    #[error("HTTP {status}: {message}")]
    Http5xx { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("malformed URL: {0}")]
    MalformedUrl(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Transient kinds are retried with backoff, everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Http5xx { .. } | Self::RateLimited { .. } | Self::NetworkUnreachable(_)
        )
    }

    /// Server-specified delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout.as_millis() as u64)
        } else if e.is_builder() {
            Self::MalformedUrl(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), e.to_string())
        } else {
            Self::NetworkUnreachable(e.to_string())
        }
    }

    pub(crate) fn from_status(status: u16, message: String) -> Self {
        if status >= 500 {
            Self::Http5xx { status, message }
        } else {
            Self::Http4xx { status, message }
        }
    }
}

/// Terminal transport outcome together with the number of attempts spent on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct SendFailure {
    pub error: TransportError,
    pub attempts: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload matches no supported image format")]
    UnsupportedFormat,

    #[error("payload is truncated")]
    Truncated,

    #[error("decoded dimensions {width}x{height} outside 1..={max}")]
    DimensionMismatch { width: u32, height: u32, max: u32 },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("asset conflict: {0}")]
    Conflict(String),

    #[error("asset store unavailable: {0}")]
    Unavailable(String),

    #[error("asset rejected: {0}")]
    Rejected(String),
}

/// Reason a job ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("{error} (after {attempts} attempt(s))")]
    Transport { error: TransportError, attempts: u32 },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("job deadline of {deadline_ms}ms exceeded (after {attempts} attempt(s))")]
    DeadlineExceeded { deadline_ms: u64, attempts: u32 },

    #[error("orchestrator shut down")]
    ShutDown,

    /// The job's task ended without reaching a terminal state, e.g. a panic.
    #[error("job aborted: {0}")]
    Aborted(String),
}

impl From<SendFailure> for JobError {
    fn from(failure: SendFailure) -> Self {
        Self::Transport {
            error: failure.error,
            attempts: failure.attempts,
        }
    }
}

impl JobError {
    /// Short name of the originating error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(BuildError::InvalidSpec(_)) => "InvalidSpec",
            Self::Transport { error, .. } => match error {
                TransportError::Timeout(_) => "Timeout",
                TransportError::Http4xx { .. } => "Http4xx",
                TransportError::Http5xx { .. } => "Http5xx",
                TransportError::RateLimited { .. } => "RateLimited",
                TransportError::Cancelled => "Cancelled",
                TransportError::NetworkUnreachable(_) => "NetworkUnreachable",
                TransportError::MalformedUrl(_) => "MalformedUrl",
                TransportError::InvalidResponse(_) => "InvalidResponse",
            },
            Self::Decode(error) => match error {
                DecodeError::UnsupportedFormat => "UnsupportedFormat",
                DecodeError::Truncated => "Truncated",
                DecodeError::DimensionMismatch { .. } => "DimensionMismatch",
                DecodeError::Malformed(_) => "Malformed",
            },
            Self::Sink(error) => match error {
                SinkError::Conflict(_) => "Conflict",
                SinkError::Unavailable(_) => "Unavailable",
                SinkError::Rejected(_) => "Rejected",
            },
            Self::DeadlineExceeded { .. } => "DeadlineExceeded",
            Self::ShutDown => "ShutDown",
            Self::Aborted(_) => "Aborted",
        }
    }

    /// Attempts spent in transport before the failure, when transport was reached.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Transport { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("slot '{slot}' is busy with job {job}")]
    SlotBusy { slot: String, job: JobId },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} has not reached a terminal state")]
    NotTerminal(JobId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },
}
