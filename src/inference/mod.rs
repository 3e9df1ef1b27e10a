pub mod executor;
pub mod retry;
pub mod router;
pub mod scope;

use crate::{
    artifact::{ArtifactSlot, ArtifactStore, GeneratedArtifact},
    clock::{Clock, SystemClock},
    config::PipelineConfig,
    error::{GenerationError, Result},
    logger,
    models::GenerationRequest,
    normalizer::InputNormalizer,
    rate_limiter::{Admission, RateLimiter},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use executor::{HttpExecutor, RequestExecutor};
pub use retry::RetryOrchestrator;
pub use router::ModelFallbackRouter;
pub use scope::{CallScope, Interrupt};

/// The single entry point: normalize, admit, route across models and hand
/// back an artifact handle.
pub struct ImagePipeline {
    config: PipelineConfig,
    normalizer: InputNormalizer,
    limiter: Arc<RateLimiter>,
    router: ModelFallbackRouter,
    artifacts: Arc<ArtifactStore>,
    shutdown: CancellationToken,
}

impl ImagePipeline {
    /// Builds a pipeline that talks to the configured inference endpoint.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let executor = HttpExecutor::new(&config)?;
        Self::with_executor(config, Arc::new(executor), Arc::new(SystemClock))
    }

    /// Builds a pipeline around any executor and clock.
    pub fn with_executor(
        config: PipelineConfig,
        executor: Arc<dyn RequestExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let artifacts = Arc::new(ArtifactStore::new());
        let router = ModelFallbackRouter::new(
            config.candidates.clone(),
            RetryOrchestrator::new(executor, config.retry.clone()),
            artifacts.clone(),
        );

        Ok(Self {
            normalizer: InputNormalizer::new(config.dimensions),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone(), clock)),
            router,
            artifacts,
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// A "current image" slot backed by this pipeline's artifact store.
    pub fn new_slot(&self) -> ArtifactSlot {
        ArtifactSlot::new(self.artifacts.clone())
    }

    /// Starts the periodic rate-limit sweep. Stops when the pipeline is dropped.
    pub fn start_maintenance(&self) -> JoinHandle<()> {
        self.limiter
            .spawn_sweeper(self.config.rate_limit.sweep_interval, self.shutdown.child_token())
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
        caller_id: &str,
    ) -> Result<GeneratedArtifact> {
        self.generate_with_cancel(request, caller_id, CancellationToken::new())
            .await
    }

    /// Like [`generate`](Self::generate), also aborting as soon as `cancel` fires.
    pub async fn generate_with_cancel(
        &self,
        request: GenerationRequest,
        caller_id: &str,
        cancel: CancellationToken,
    ) -> Result<GeneratedArtifact> {
        let _timer = logger::timer("image generation");

        let normalized = self.normalizer.normalize(
            &request.prompt,
            request.negative_prompt.as_deref().unwrap_or_default(),
            request.width.unwrap_or(self.config.default_width),
            request.height.unwrap_or(self.config.default_height),
        )?;

        match self.limiter.admit(caller_id) {
            Admission::Allowed { remaining } => {
                log::debug!("Admitted {} ({} left in window)", caller_id, remaining);
            }
            Admission::Denied { retry_after } => {
                log::info!(
                    "Denied {} for another {}s",
                    caller_id,
                    retry_after.as_secs()
                );
                return Err(GenerationError::RateLimited { retry_after });
            }
        }

        let scope = CallScope::new(self.config.request_timeout, cancel);
        self.router
            .dispatch(normalized.with_seed(request.seed), &scope)
            .await
    }

    /// Generates into `slot`, releasing the slot's previous image on success.
    pub async fn generate_into(
        &self,
        slot: &ArtifactSlot,
        request: GenerationRequest,
        caller_id: &str,
    ) -> Result<GeneratedArtifact> {
        let artifact = self.generate(request, caller_id).await?;
        slot.replace(artifact.clone());
        Ok(artifact)
    }
}

impl Drop for ImagePipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
