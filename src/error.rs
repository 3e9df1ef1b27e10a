use std::fmt;
use std::time::Duration;

/// Why a single attempt against a model candidate did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ColdStart,
    RateLimited,
    Server { status: u16, message: String },
    Transport(String),
    Unauthorized { status: u16 },
    Rejected { status: u16, message: String },
    MalformedResponse(String),
    Timeout,
    Cancelled,
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ColdStart => write!(f, "model is still loading"),
            FailureReason::RateLimited => write!(f, "inference API rate limit reached"),
            FailureReason::Server { status, message } => {
                write!(f, "server error ({}): {}", status, message)
            }
            FailureReason::Transport(msg) => write!(f, "transport error: {}", msg),
            FailureReason::Unauthorized { status } => {
                write!(f, "credentials rejected by inference API ({})", status)
            }
            FailureReason::Rejected { status, message } => {
                write!(f, "request rejected ({}): {}", status, message)
            }
            FailureReason::MalformedResponse(msg) => write!(f, "malformed response: {}", msg),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Internal(msg) => write!(f, "internal fault: {}", msg),
        }
    }
}

/// Machine-readable classification of a [`GenerationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    RateLimited,
    RetryableRemote,
    FatalRemote,
    Timeout,
    Exhausted,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::RetryableRemote => "retryable_remote_error",
            ErrorKind::FatalRemote => "fatal_remote_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Config => "config_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Too many requests, please wait {} seconds", retry_after_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    #[error("Model {model} failed: {reason}")]
    RetryableRemote { model: String, reason: FailureReason },

    #[error("Model {model} failed permanently: {reason}")]
    FatalRemote { model: String, reason: FailureReason },

    /// Deadline elapsed or the caller cancelled. Try a simpler prompt or a longer timeout.
    #[error("Generation timed out: {0}")]
    Timeout(String),

    #[error("All {candidates} model candidates failed, last error: {last}")]
    Exhausted {
        candidates: usize,
        last: Box<GenerationError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::Validation(_) => ErrorKind::Validation,
            GenerationError::RateLimited { .. } => ErrorKind::RateLimited,
            GenerationError::RetryableRemote { .. } => ErrorKind::RetryableRemote,
            GenerationError::FatalRemote { .. } => ErrorKind::FatalRemote,
            GenerationError::Timeout(_) => ErrorKind::Timeout,
            GenerationError::Exhausted { .. } => ErrorKind::Exhausted,
            GenerationError::Config(_) => ErrorKind::Config,
            GenerationError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The terminal failure of the last candidate when every candidate failed.
    pub fn last_failure(&self) -> Option<&GenerationError> {
        match self {
            GenerationError::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Wait hint for rate-limited callers, in whole seconds rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GenerationError::RateLimited { retry_after } => Some(retry_after_secs(retry_after)),
            _ => None,
        }
    }
}

fn retry_after_secs(retry_after: &Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;
