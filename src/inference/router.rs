use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::{
    artifact::{ArtifactStore, GeneratedArtifact},
    error::{FailureReason, GenerationError, Result},
    inference::{retry::RetryOrchestrator, scope::CallScope},
    models::{AttemptOutcome, ModelCandidate, NormalizedRequest},
};

/// Tries candidates strictly one after another: the first success wins and,
/// when all fail, the last candidate's failure is the one reported.
pub struct ModelFallbackRouter {
    candidates: Vec<ModelCandidate>,
    retry: RetryOrchestrator,
    artifacts: Arc<ArtifactStore>,
}

impl ModelFallbackRouter {
    /// # Panics
    ///
    /// Panics if `candidates` is empty.
    pub fn new(
        candidates: Vec<ModelCandidate>,
        retry: RetryOrchestrator,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        assert!(
            !candidates.is_empty(),
            "ModelFallbackRouter needs at least one candidate"
        );
        Self {
            candidates,
            retry,
            artifacts,
        }
    }

    pub fn candidates(&self) -> &[ModelCandidate] {
        &self.candidates
    }

    pub async fn dispatch(
        &self,
        request: NormalizedRequest,
        scope: &CallScope,
    ) -> Result<GeneratedArtifact> {
        // Same seed for every retry and every candidate.
        let request = request.with_resolved_seed();
        let seed = request.seed;
        let total = self.candidates.len();
        let mut last_error = None;

        for (index, candidate) in self.candidates.iter().enumerate() {
            log::info!(
                "Generating with model {} ({:?}, {}/{})",
                candidate.identifier,
                candidate.role,
                index + 1,
                total
            );

            let outcome = AssertUnwindSafe(self.retry.attempt(candidate, &request, scope))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    log::error!("Executor for {} panicked: {}", candidate.identifier, message);
                    AttemptOutcome::FatalFailure(FailureReason::Internal(message))
                });

            let error = match outcome {
                AttemptOutcome::Success(bytes) => {
                    log::info!(
                        "Model {} produced {} bytes",
                        candidate.identifier,
                        bytes.len()
                    );
                    return Ok(self
                        .artifacts
                        .materialize(bytes, &candidate.identifier, seed));
                }
                AttemptOutcome::FatalFailure(FailureReason::Timeout) => {
                    return Err(GenerationError::Timeout(format!(
                        "no image within {}s while trying {}",
                        scope.budget().as_secs(),
                        candidate.identifier
                    )));
                }
                AttemptOutcome::FatalFailure(FailureReason::Cancelled) => {
                    return Err(GenerationError::Timeout(
                        "request was cancelled".to_string(),
                    ));
                }
                AttemptOutcome::FatalFailure(reason) => GenerationError::FatalRemote {
                    model: candidate.identifier.clone(),
                    reason,
                },
                AttemptOutcome::RetryableFailure { reason, .. } => {
                    GenerationError::RetryableRemote {
                        model: candidate.identifier.clone(),
                        reason,
                    }
                }
            };

            if index + 1 < total {
                log::warn!("{}, falling back to next model", error);
            }
            last_error = Some(error);
        }

        let last = last_error.unwrap_or_else(|| {
            GenerationError::Internal("no model candidate was attempted".to_string())
        });
        log::error!("All {} model candidates failed: {}", total, last);
        Err(GenerationError::Exhausted {
            candidates: total,
            last: Box::new(last),
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}
