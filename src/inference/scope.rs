//! One deadline and one cancellation token per logical request.
//!
//! Every suspension point of a request (the HTTP call, error backoff and
//! cold-start waits) goes through a [`CallScope`], so the deadline or an
//! external cancel interrupts whichever of them is pending. The losing future
//! is dropped, which aborts an in-flight HTTP call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FailureReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Timeout,
    Cancelled,
}

impl From<Interrupt> for FailureReason {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Timeout => FailureReason::Timeout,
            Interrupt::Cancelled => FailureReason::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallScope {
    cancel: CancellationToken,
    deadline: Instant,
    budget: Duration,
}

// Stand-in deadline for budgets too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

impl CallScope {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self {
            cancel,
            deadline,
            budget: timeout,
        }
    }

    /// The total time this request was given.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Checks the scope without waiting.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(Interrupt::Timeout)
        } else {
            Ok(())
        }
    }

    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupt::Timeout),
            output = future => Ok(output),
        }
    }

    /// Cancellable wait. Returns early with an [`Interrupt`] if the deadline
    /// falls inside the wait.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.guard(tokio::time::sleep(duration)).await
    }
}
