//! Reliable text-to-image generation against a hosted inference API.
//!
//! A request flows through [`normalizer::InputNormalizer`], the per-caller
//! [`rate_limiter::RateLimiter`], and then the [`inference::ModelFallbackRouter`],
//! which drives the [`inference::RetryOrchestrator`] and [`inference::RequestExecutor`]
//! once per candidate model. The result is a [`GeneratedArtifact`] whose bytes
//! live in an [`artifact::ArtifactStore`] until the caller releases them.

pub mod artifact;
pub mod clock;
pub mod config;
pub mod error;
pub mod inference;
pub mod logger;
pub mod models;
pub mod normalizer;
pub mod rate_limiter;

pub use artifact::{ArtifactHandle, ArtifactSlot, ArtifactStore, GeneratedArtifact};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DimensionBounds, InferenceParams, PipelineConfig, RateLimitConfig, RetryConfig};
pub use error::{ErrorKind, FailureReason, GenerationError, Result};
pub use inference::{CallScope, HttpExecutor, ImagePipeline, RequestExecutor};
pub use models::{AttemptOutcome, GenerationRequest, ModelCandidate, ModelRole, NormalizedRequest};
pub use rate_limiter::{Admission, RateLimitRecord, RateLimiter};
