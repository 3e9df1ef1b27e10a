use crate::error::FailureReason;
use std::time::Duration;

/// Result of one attempt against one candidate, decoded once at the HTTP boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(Vec<u8>),
    RetryableFailure {
        reason: FailureReason,
        wait_hint: Option<Duration>,
    },
    FatalFailure(FailureReason),
}

impl AttemptOutcome {
    pub fn retryable(reason: FailureReason) -> Self {
        AttemptOutcome::RetryableFailure {
            reason,
            wait_hint: None,
        }
    }

    pub fn cold_start(estimated: Option<Duration>) -> Self {
        AttemptOutcome::RetryableFailure {
            reason: FailureReason::ColdStart,
            wait_hint: estimated,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }

    /// Deadline or caller cancellation, which ends the whole request.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::FatalFailure(FailureReason::Timeout | FailureReason::Cancelled)
        )
    }
}
