use crate::{
    error::{GenerationError, Result},
    models::{ModelCandidate, ModelRole},
};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://api-inference.huggingface.co/models";
pub const DEFAULT_PRIMARY_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const DEFAULT_FALLBACK_MODELS: [&str; 2] = [
    "stabilityai/stable-diffusion-2-1",
    "runwayml/stable-diffusion-v1-5",
];

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    pub block_duration: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 10,
            block_duration: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, window: Duration, max_requests: u32) -> Self {
        self.window = window;
        self.max_requests = max_requests;
        self
    }

    pub fn with_block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Standard attempts per candidate. Cold-start waits do not count.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single cold-start wait.
    pub cold_start_cap: Duration,
    pub max_cold_start_waits: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            cold_start_cap: Duration::from_secs(30),
            max_cold_start_waits: 5,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_cold_start(mut self, cap: Duration, max_waits: u32) -> Self {
        self.cold_start_cap = cap;
        self.max_cold_start_waits = max_waits;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionBounds {
    pub min: u32,
    pub max: u32,
}

impl Default for DimensionBounds {
    fn default() -> Self {
        DimensionBounds {
            min: 256,
            max: 1024,
        }
    }
}

impl DimensionBounds {
    pub fn clamp(&self, value: u32) -> u32 {
        value.clamp(self.min, self.max)
    }
}

/// Sampling parameters forwarded to the inference API with every attempt.
#[derive(Debug, Clone)]
pub struct InferenceParams {
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub scheduler: String,
}

impl Default for InferenceParams {
    fn default() -> Self {
        InferenceParams {
            num_inference_steps: 30,
            guidance_scale: 7.5,
            scheduler: "DPMSolverMultistepScheduler".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_token: Option<String>,
    pub endpoint: String,
    pub candidates: Vec<ModelCandidate>,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub dimensions: DimensionBounds,
    pub default_width: u32,
    pub default_height: u32,
    pub inference: InferenceParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut candidates = vec![ModelCandidate::primary(DEFAULT_PRIMARY_MODEL)];
        candidates.extend(DEFAULT_FALLBACK_MODELS.iter().map(|id| ModelCandidate::fallback(*id)));

        PipelineConfig {
            api_token: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            candidates,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(120),
            dimensions: DimensionBounds::default(),
            default_width: 512,
            default_height: 512,
            inference: InferenceParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.api_token = env::var("HF_API_TOKEN").ok().filter(|t| !t.is_empty());
        if let Ok(endpoint) = env::var("IMAGEGEN_ENDPOINT") {
            config.endpoint = endpoint;
        }

        let primary = env::var("IMAGEGEN_PRIMARY_MODEL")
            .unwrap_or_else(|_| DEFAULT_PRIMARY_MODEL.to_string());
        let fallbacks: Vec<String> = match env::var("IMAGEGEN_FALLBACK_MODELS") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => DEFAULT_FALLBACK_MODELS.iter().map(|s| s.to_string()).collect(),
        };
        config = config.with_models(primary, fallbacks);

        if let Some(window) = env_secs("RATE_LIMIT_WINDOW_SECS") {
            config.rate_limit.window = window;
        }
        if let Some(max_requests) = env_parse("RATE_LIMIT_MAX_REQUESTS") {
            config.rate_limit.max_requests = max_requests;
        }
        if let Some(block) = env_secs("RATE_LIMIT_BLOCK_SECS") {
            config.rate_limit.block_duration = block;
        }
        if let Some(max_attempts) = env_parse("RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(millis) = env_parse::<u64>("RETRY_INITIAL_DELAY_MS") {
            config.retry.initial_delay = Duration::from_millis(millis);
        }
        if let Some(timeout) = env_secs("REQUEST_TIMEOUT_SECS") {
            config.request_timeout = timeout;
        }
        config
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Replaces the candidate list: `primary` first, then `fallbacks` in order.
    pub fn with_models<I, S>(mut self, primary: impl Into<String>, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidates = vec![ModelCandidate::primary(primary)];
        self.candidates
            .extend(fallbacks.into_iter().map(ModelCandidate::fallback));
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_dimensions(mut self, min: u32, max: u32) -> Self {
        self.dimensions = DimensionBounds { min, max };
        self
    }

    pub fn with_inference(mut self, inference: InferenceParams) -> Self {
        self.inference = inference;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidates.is_empty() {
            return Err(GenerationError::Config(
                "At least one model candidate is required".into(),
            ));
        }
        if self.candidates[0].role != ModelRole::Primary {
            return Err(GenerationError::Config(
                "The first model candidate must be the primary".into(),
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window.is_zero() {
            return Err(GenerationError::Config(
                "Rate limit window and max requests must be positive".into(),
            ));
        }
        if self.rate_limit.block_duration.is_zero() {
            return Err(GenerationError::Config(
                "Rate limit block duration must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(GenerationError::Config(
                "Retry max attempts must be at least 1".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(GenerationError::Config(
                "Request timeout must be positive".into(),
            ));
        }
        if self.dimensions.min == 0 || self.dimensions.min > self.dimensions.max {
            return Err(GenerationError::Config(format!(
                "Invalid dimension bounds {}..={}",
                self.dimensions.min, self.dimensions.max
            )));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
