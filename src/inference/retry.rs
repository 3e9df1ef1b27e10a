//! Retry policy for a single candidate.
//!
//! Two independent waits apply. Error backoff grows exponentially from
//! `initial_delay` and consumes the attempt budget. Cold-start waits follow
//! the remote's warm-up estimate, capped, and do not consume it.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::RetryConfig,
    error::FailureReason,
    inference::{executor::RequestExecutor, scope::CallScope},
    models::{AttemptOutcome, ModelCandidate, NormalizedRequest},
};

/// Backoff before the retry that follows failed attempt `attempt_index` (0-based).
pub fn backoff_delay(config: &RetryConfig, attempt_index: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt_index);
    config
        .initial_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// How long to wait for a cold model, given the remote's estimate.
pub fn cold_start_wait(config: &RetryConfig, estimate: Option<Duration>) -> Duration {
    estimate
        .unwrap_or(config.cold_start_cap)
        .min(config.cold_start_cap)
}

#[derive(Clone)]
pub struct RetryOrchestrator {
    executor: Arc<dyn RequestExecutor>,
    config: RetryConfig,
}

impl RetryOrchestrator {
    pub fn new(executor: Arc<dyn RequestExecutor>, config: RetryConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs attempts against `candidate` until one succeeds or the policy gives
    /// up, and returns the terminal outcome.
    ///
    /// A remote rate limit is returned immediately so the router can move on
    /// to a less busy candidate. Timeouts and cancellation are always terminal.
    pub async fn attempt(
        &self,
        candidate: &ModelCandidate,
        request: &NormalizedRequest,
        scope: &CallScope,
    ) -> AttemptOutcome {
        let model = candidate.identifier.as_str();
        let max_attempts = self.config.max_attempts.max(1);
        let mut failures = 0u32;
        let mut cold_waits = 0u32;

        loop {
            if let Err(interrupt) = scope.check() {
                return AttemptOutcome::FatalFailure(interrupt.into());
            }

            let outcome = match scope
                .guard(self.executor.execute(model, request, scope.token(), scope.remaining()))
                .await
            {
                Ok(outcome) => outcome,
                Err(interrupt) => return AttemptOutcome::FatalFailure(interrupt.into()),
            };

            match outcome {
                AttemptOutcome::Success(_) | AttemptOutcome::FatalFailure(_) => return outcome,
                AttemptOutcome::RetryableFailure {
                    reason: FailureReason::RateLimited,
                    ..
                } => {
                    log::warn!("Model {} is rate limited, not retrying it", model);
                    return outcome;
                }
                AttemptOutcome::RetryableFailure {
                    reason: FailureReason::ColdStart,
                    wait_hint,
                } if cold_waits < self.config.max_cold_start_waits => {
                    cold_waits += 1;
                    let wait = cold_start_wait(&self.config, wait_hint);
                    log::info!(
                        "Model {} is warming up, waiting {:.1}s ({}/{})",
                        model,
                        wait.as_secs_f64(),
                        cold_waits,
                        self.config.max_cold_start_waits
                    );
                    if let Err(interrupt) = scope.sleep(wait).await {
                        return AttemptOutcome::FatalFailure(interrupt.into());
                    }
                }
                AttemptOutcome::RetryableFailure { ref reason, .. } => {
                    let attempt_index = failures;
                    failures += 1;
                    if failures >= max_attempts {
                        log::warn!(
                            "Model {} failed {} times, giving up: {}",
                            model,
                            failures,
                            reason
                        );
                        return outcome;
                    }

                    let delay = backoff_delay(&self.config, attempt_index);
                    log::warn!(
                        "Model {} attempt {}/{} failed ({}), retrying in {}ms",
                        model,
                        failures,
                        max_attempts,
                        reason,
                        delay.as_millis()
                    );
                    if let Err(interrupt) = scope.sleep(delay).await {
                        return AttemptOutcome::FatalFailure(interrupt.into());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    /// Replays scripted outcomes per model; repeats the last one when the
    /// script runs dry. A `None` step never completes.
    #[derive(Default)]
    pub(crate) struct ScriptedExecutor {
        scripts: Mutex<std::collections::HashMap<String, VecDeque<Option<AttemptOutcome>>>>,
        pub(crate) calls: Mutex<Vec<(String, Option<u64>)>>,
    }

    impl ScriptedExecutor {
        pub(crate) fn script(self, model: &str, steps: Vec<Option<AttemptOutcome>>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(model.to_string(), steps.into());
            self
        }

        pub(crate) fn calls_to(&self, model: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == model)
                .count()
        }
    }

    #[async_trait]
    impl RequestExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            model: &str,
            request: &NormalizedRequest,
            _cancel: &CancellationToken,
            _timeout: Duration,
        ) -> AttemptOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), request.seed));
            let step = {
                let mut scripts = self.scripts.lock().unwrap();
                let script = scripts.get_mut(model).expect("unscripted model");
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            match step {
                Some(outcome) => outcome,
                None => std::future::pending().await,
            }
        }
    }

    pub(crate) fn request() -> NormalizedRequest {
        NormalizedRequest {
            prompt: "sunset over mountains, highly detailed".into(),
            negative_prompt: "blurry".into(),
            width: 512,
            height: 512,
            seed: Some(7),
        }
    }

    pub(crate) fn server_error() -> AttemptOutcome {
        AttemptOutcome::retryable(FailureReason::Server {
            status: 500,
            message: "boom".into(),
        })
    }

    fn orchestrator(executor: Arc<ScriptedExecutor>) -> RetryOrchestrator {
        RetryOrchestrator::new(executor, RetryConfig::default())
    }

    fn scope(secs: u64) -> CallScope {
        CallScope::new(Duration::from_secs(secs), CancellationToken::new())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig::default().with_backoff(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|i| backoff_delay(&config, i).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff_delay(&config, 200), Duration::from_secs(5));
    }

    #[test]
    fn cold_start_wait_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(
            cold_start_wait(&config, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            cold_start_wait(&config, Some(Duration::from_secs(500))),
            config.cold_start_cap
        );
        assert_eq!(cold_start_wait(&config, None), config.cold_start_cap);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff_then_succeeds() {
        let executor = Arc::new(ScriptedExecutor::default().script(
            "m",
            vec![
                Some(server_error()),
                Some(server_error()),
                Some(AttemptOutcome::Success(vec![1, 2, 3])),
            ],
        ));
        let started = Instant::now();
        let outcome = orchestrator(executor.clone())
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(120))
            .await;

        assert_eq!(outcome, AttemptOutcome::Success(vec![1, 2, 3]));
        assert_eq!(executor.calls_to("m"), 3);
        // 1s + 2s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let executor = Arc::new(ScriptedExecutor::default().script("m", vec![Some(server_error())]));
        let outcome = orchestrator(executor.clone())
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(120))
            .await;

        assert_eq!(outcome, server_error());
        assert_eq!(executor.calls_to("m"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_waits_do_not_consume_attempts() {
        let executor = Arc::new(ScriptedExecutor::default().script(
            "m",
            vec![
                Some(AttemptOutcome::cold_start(Some(Duration::from_secs(5)))),
                Some(server_error()),
                Some(AttemptOutcome::cold_start(Some(Duration::from_secs(5)))),
                Some(server_error()),
                Some(AttemptOutcome::Success(vec![9])),
            ],
        ));
        let started = Instant::now();
        let outcome = orchestrator(executor.clone())
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(120))
            .await;

        assert_eq!(outcome, AttemptOutcome::Success(vec![9]));
        assert_eq!(executor.calls_to("m"), 5);
        // Two cold-start waits of 5s plus backoff of 1s and 2s
        assert_eq!(started.elapsed(), Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_beyond_limit_counts_as_failure() {
        let executor = Arc::new(ScriptedExecutor::default().script(
            "m",
            vec![Some(AttemptOutcome::cold_start(Some(Duration::from_secs(1))))],
        ));
        let config = RetryConfig::default().with_cold_start(Duration::from_secs(30), 2);
        let outcome = RetryOrchestrator::new(executor.clone(), config)
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(600))
            .await;

        assert_eq!(outcome, AttemptOutcome::cold_start(Some(Duration::from_secs(1))));
        // 2 free cold-start waits, then 3 counted attempts
        assert_eq!(executor.calls_to("m"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_rate_limit_is_not_retried() {
        let limited = AttemptOutcome::RetryableFailure {
            reason: FailureReason::RateLimited,
            wait_hint: Some(Duration::from_secs(30)),
        };
        let executor = Arc::new(ScriptedExecutor::default().script("m", vec![Some(limited.clone())]));
        let outcome = orchestrator(executor.clone())
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(120))
            .await;

        assert_eq!(outcome, limited);
        assert_eq!(executor.calls_to("m"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_not_retried() {
        let fatal = AttemptOutcome::FatalFailure(FailureReason::Unauthorized { status: 401 });
        let executor = Arc::new(ScriptedExecutor::default().script("m", vec![Some(fatal.clone())]));
        let outcome = orchestrator(executor.clone())
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(120))
            .await;

        assert_eq!(outcome, fatal);
        assert_eq!(executor.calls_to("m"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_backoff() {
        let executor = Arc::new(ScriptedExecutor::default().script("m", vec![Some(server_error())]));
        let config = RetryConfig::default().with_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let started = Instant::now();
        let outcome = RetryOrchestrator::new(executor.clone(), config)
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(10))
            .await;

        assert_eq!(outcome, AttemptOutcome::FatalFailure(FailureReason::Timeout));
        assert_eq!(executor.calls_to("m"), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_hung_call() {
        let executor = Arc::new(ScriptedExecutor::default().script("m", vec![None]));
        let outcome = orchestrator(executor)
            .attempt(&ModelCandidate::primary("m"), &request(), &scope(30))
            .await;

        assert!(outcome.is_interrupted());
    }
}
