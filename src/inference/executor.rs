use crate::{
    config::{InferenceParams, PipelineConfig},
    error::{FailureReason, GenerationError, Result},
    models::{
        AttemptOutcome, InferenceOptions, InferenceParameters, InferencePayload,
        NormalizedRequest, RemoteErrorBody,
    },
};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_ERROR_MESSAGE_CHARS: usize = 300;

/// Performs exactly one call against one model.
///
/// Implementations must map every failure into an [`AttemptOutcome`] rather
/// than panic, and must give up once `cancel` fires or `timeout` elapses.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(
        &self,
        model: &str,
        request: &NormalizedRequest,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> AttemptOutcome;
}

/// [`RequestExecutor`] for the hosted inference HTTP API.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
    params: InferenceParams,
}

impl HttpExecutor {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("imagine-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GenerationError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, config))
    }

    /// Reuses an existing [`reqwest::Client`] and its connection pool.
    pub fn with_client(client: Client, config: &PipelineConfig) -> Self {
        if config.api_token.is_none() {
            log::warn!("No inference API token configured, requests will be anonymous");
        }
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            params: config.inference.clone(),
        }
    }

    fn model_url(&self, model: &str) -> String {
        format!("{}/{}", self.endpoint, model)
    }

    fn build_payload<'a>(&'a self, request: &'a NormalizedRequest) -> InferencePayload<'a> {
        InferencePayload {
            inputs: &request.prompt,
            parameters: InferenceParameters {
                negative_prompt: &request.negative_prompt,
                width: request.width,
                height: request.height,
                num_inference_steps: self.params.num_inference_steps,
                guidance_scale: self.params.guidance_scale,
                seed: request.seed,
                scheduler: &self.params.scheduler,
            },
            options: InferenceOptions {
                wait_for_model: false,
                use_cache: false,
            },
        }
    }

    async fn send(&self, model: &str, request: &NormalizedRequest, timeout: Duration) -> AttemptOutcome {
        let request_id = Uuid::new_v4().to_string();
        log::debug!(
            "POST {} [req:{}] {}x{} seed={:?}",
            self.model_url(model),
            request_id,
            request.width,
            request.height,
            request.seed
        );

        let mut builder = self
            .client
            .post(self.model_url(model))
            .timeout(timeout)
            .header("X-Request-Id", &request_id)
            .header(header::ACCEPT, "image/png, image/jpeg, image/webp, application/json")
            .json(&self.build_payload(request));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return transport_outcome(&e),
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return transport_outcome(&e),
        };

        log::debug!(
            "Model {} answered {} with {} bytes [req:{}]",
            model,
            status,
            body.len(),
            request_id
        );
        classify_response(status, content_type.as_deref(), &body, retry_after)
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(
        &self,
        model: &str,
        request: &NormalizedRequest,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> AttemptOutcome {
        // Also raced by `CallScope::guard`; kept so the executor honours
        // `cancel` when called on its own.
        tokio::select! {
            _ = cancel.cancelled() => AttemptOutcome::FatalFailure(FailureReason::Cancelled),
            outcome = self.send(model, request, timeout) => outcome,
        }
    }
}

fn transport_outcome(error: &reqwest::Error) -> AttemptOutcome {
    if error.is_timeout() {
        AttemptOutcome::FatalFailure(FailureReason::Timeout)
    } else {
        AttemptOutcome::retryable(FailureReason::Transport(error.to_string()))
    }
}

/// Maps one HTTP response from the inference API to an [`AttemptOutcome`].
pub fn classify_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: &[u8],
    retry_after: Option<Duration>,
) -> AttemptOutcome {
    let is_json = content_type.map_or(false, |ct| ct.contains("json"))
        || body.first().map_or(false, |b| *b == b'{' || *b == b'[');

    if status.is_success() {
        if body.is_empty() {
            return AttemptOutcome::retryable(FailureReason::MalformedResponse(
                "empty image body".into(),
            ));
        }
        if is_json {
            let message = error_message(body).unwrap_or_else(|| "expected image bytes".into());
            return AttemptOutcome::retryable(FailureReason::MalformedResponse(message));
        }
        return AttemptOutcome::Success(body.to_vec());
    }

    let parsed: RemoteErrorBody = if is_json {
        serde_json::from_slice(body).unwrap_or_default()
    } else {
        RemoteErrorBody::default()
    };
    let message = parsed
        .message()
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    let message = truncate(message.trim());

    match status.as_u16() {
        401 | 403 => AttemptOutcome::FatalFailure(FailureReason::Unauthorized {
            status: status.as_u16(),
        }),
        429 => AttemptOutcome::RetryableFailure {
            reason: FailureReason::RateLimited,
            wait_hint: retry_after,
        },
        400 | 404 | 413 | 422 => AttemptOutcome::FatalFailure(FailureReason::Rejected {
            status: status.as_u16(),
            message,
        }),
        code if status.is_server_error()
            && (parsed.estimated_time.is_some() || message.to_lowercase().contains("loading")) =>
        {
            log::debug!("Model cold start ({}): {}", code, message);
            AttemptOutcome::cold_start(
                parsed
                    .estimated_time
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(Duration::from_secs_f64),
            )
        }
        code => AttemptOutcome::retryable(FailureReason::Server {
            status: code,
            message,
        }),
    }
}

fn error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<RemoteErrorBody>(body)
        .ok()
        .and_then(|b| b.message())
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        message.to_string()
    } else {
        let mut cut: String = message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
        cut.push_str("...");
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn image_body_is_success() {
        let outcome = classify_response(StatusCode::OK, Some("image/png"), PNG, None);
        assert_eq!(outcome, AttemptOutcome::Success(PNG.to_vec()));
    }

    #[test]
    fn json_on_success_status_is_malformed() {
        let outcome = classify_response(
            StatusCode::OK,
            Some("application/json"),
            br#"{"error":"no image"}"#,
            None,
        );
        assert!(matches!(
            outcome,
            AttemptOutcome::RetryableFailure {
                reason: FailureReason::MalformedResponse(ref m),
                ..
            } if m == "no image"
        ));
    }

    #[test]
    fn loading_body_is_cold_start_with_estimate() {
        let body = br#"{"error":"Model stabilityai/sdxl is currently loading","estimated_time":5.0}"#;
        let outcome = classify_response(
            StatusCode::SERVICE_UNAVAILABLE,
            Some("application/json"),
            body,
            None,
        );
        assert_eq!(
            outcome,
            AttemptOutcome::cold_start(Some(Duration::from_secs(5)))
        );
    }

    #[test]
    fn loading_without_estimate_has_no_hint() {
        let outcome = classify_response(
            StatusCode::SERVICE_UNAVAILABLE,
            None,
            br#"{"error":"Model is loading"}"#,
            None,
        );
        assert_eq!(outcome, AttemptOutcome::cold_start(None));
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let outcome = classify_response(
            StatusCode::TOO_MANY_REQUESTS,
            Some("text/plain"),
            b"slow down",
            Some(Duration::from_secs(12)),
        );
        assert_eq!(
            outcome,
            AttemptOutcome::RetryableFailure {
                reason: FailureReason::RateLimited,
                wait_hint: Some(Duration::from_secs(12)),
            }
        );
    }

    #[test]
    fn auth_errors_are_fatal() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let outcome = classify_response(status, None, b"", None);
            assert_eq!(
                outcome,
                AttemptOutcome::FatalFailure(FailureReason::Unauthorized {
                    status: status.as_u16()
                })
            );
        }
    }

    #[test]
    fn malformed_request_is_fatal_and_keeps_message() {
        let outcome = classify_response(
            StatusCode::BAD_REQUEST,
            Some("application/json"),
            br#"{"error":["width must be a multiple of 8"]}"#,
            None,
        );
        assert_eq!(
            outcome,
            AttemptOutcome::FatalFailure(FailureReason::Rejected {
                status: 400,
                message: "width must be a multiple of 8".into()
            })
        );
    }

    #[test]
    fn plain_server_error_is_retryable() {
        let outcome = classify_response(StatusCode::BAD_GATEWAY, None, b"upstream hiccup", None);
        assert_eq!(
            outcome,
            AttemptOutcome::retryable(FailureReason::Server {
                status: 502,
                message: "upstream hiccup".into()
            })
        );
    }

    #[test]
    fn payload_carries_parameters_and_seed() {
        let executor = HttpExecutor::with_client(
            Client::new(),
            &PipelineConfig::new().with_endpoint("https://example.test/models/"),
        );
        let request = NormalizedRequest {
            prompt: "sunset, highly detailed".into(),
            negative_prompt: "blurry".into(),
            width: 768,
            height: 512,
            seed: Some(42),
        };

        let json = serde_json::to_value(executor.build_payload(&request)).unwrap();
        assert_eq!(json["inputs"], "sunset, highly detailed");
        assert_eq!(json["parameters"]["negative_prompt"], "blurry");
        assert_eq!(json["parameters"]["width"], 768);
        assert_eq!(json["parameters"]["seed"], 42);
        assert_eq!(json["parameters"]["num_inference_steps"], 30);
        assert_eq!(json["options"]["wait_for_model"], false);
        assert_eq!(
            executor.model_url("org/model"),
            "https://example.test/models/org/model"
        );
    }

    enum Reply {
        Respond(Vec<u8>),
        Stall,
    }

    fn http_response(head: &str, body: &[u8]) -> Reply {
        let mut raw = format!(
            "{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            head,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        Reply::Respond(raw)
    }

    /// Serves one canned reply per connection and records each raw request.
    async fn serve(replies: Vec<Reply>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/models", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                seen.lock().unwrap().push(request);
                match reply {
                    Reply::Respond(raw) => {
                        socket.write_all(&raw).await.unwrap();
                        socket.shutdown().await.unwrap();
                    }
                    Reply::Stall => {
                        tokio::spawn(async move {
                            let _held = socket;
                            std::future::pending::<()>().await;
                        });
                    }
                }
            }
        });
        (endpoint, requests)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&raw).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let line = line.to_ascii_lowercase();
                        line.strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn header_value(request: &str, name: &str) -> Option<String> {
        request.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }

    fn http_executor(endpoint: &str) -> HttpExecutor {
        let client = Client::builder().no_proxy().build().unwrap();
        HttpExecutor::with_client(
            client,
            &PipelineConfig::new()
                .with_endpoint(endpoint)
                .with_api_token("hf_secret"),
        )
    }

    fn normalized() -> NormalizedRequest {
        NormalizedRequest {
            prompt: "a red fox, highly detailed".into(),
            negative_prompt: "blurry".into(),
            width: 512,
            height: 512,
            seed: Some(7),
        }
    }

    #[tokio::test]
    async fn sends_bearer_token_and_fresh_request_id() {
        let (endpoint, requests) = serve(vec![
            http_response("HTTP/1.1 200 OK\r\nContent-Type: image/png", PNG),
            http_response("HTTP/1.1 200 OK\r\nContent-Type: image/png", PNG),
        ])
        .await;
        let executor = http_executor(&endpoint);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let outcome = executor
                .execute("org/model", &normalized(), &cancel, Duration::from_secs(10))
                .await;
            assert_eq!(outcome, AttemptOutcome::Success(PNG.to_vec()));
        }

        let requests = requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        let mut ids = Vec::new();
        for request in &requests {
            assert!(request.starts_with("POST /models/org/model HTTP/1.1"));
            assert_eq!(
                header_value(request, "authorization").as_deref(),
                Some("Bearer hf_secret")
            );
            let id = header_value(request, "x-request-id").unwrap();
            assert!(Uuid::parse_str(&id).is_ok(), "{}", id);
            ids.push(id);
            assert!(request.contains(r#""seed":7"#));
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn too_many_requests_reads_retry_after_header() {
        let (endpoint, _requests) = serve(vec![http_response(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Type: text/plain",
            b"slow down",
        )])
        .await;

        let outcome = http_executor(&endpoint)
            .execute(
                "org/model",
                &normalized(),
                &CancellationToken::new(),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(
            outcome,
            AttemptOutcome::RetryableFailure {
                reason: FailureReason::RateLimited,
                wait_hint: Some(Duration::from_secs(7)),
            }
        );
    }

    #[tokio::test]
    async fn stalled_server_is_a_fatal_timeout() {
        let (endpoint, requests) = serve(vec![Reply::Stall]).await;

        let outcome = http_executor(&endpoint)
            .execute(
                "org/model",
                &normalized(),
                &CancellationToken::new(),
                Duration::from_millis(200),
            )
            .await;
        assert_eq!(outcome, AttemptOutcome::FatalFailure(FailureReason::Timeout));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_drops_in_flight_request() {
        let (endpoint, _requests) = serve(vec![Reply::Stall]).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = http_executor(&endpoint)
            .execute("org/model", &normalized(), &cancel, Duration::from_secs(30))
            .await;
        assert_eq!(outcome, AttemptOutcome::FatalFailure(FailureReason::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
