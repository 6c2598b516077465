//! Telemetry delivery client
//!
//! Posts samples to the ingestion service with bounded exponential backoff.
//! A sample that still fails after the last retry is dropped; there is no
//! outbound queue.

use async_trait::async_trait;
use nimbus_core::{AgentSettings, NimbusError, Result, TelemetrySample};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const TELEMETRY_PATH: &str = "/api/telemetry";
pub const API_KEY_HEADER: &str = "X-API-Key";

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Destination for telemetry samples
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one sample. Returns whether the server accepted it.
    async fn send(&self, sample: &TelemetrySample, cancel: &CancellationToken) -> bool;
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    #[serde(default)]
    event_id: Option<i64>,
}

/// HTTP delivery to the ingestion service
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    max_retries: u32,
    base_delay: Duration,
}

impl DeliveryClient {
    pub fn new(settings: &AgentSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| NimbusError::Delivery(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: format!(
                "{}{}",
                settings.api_endpoint.trim_end_matches('/'),
                TELEMETRY_PATH
            ),
            api_key: settings.api_key.clone(),
            max_retries: settings.max_retries,
            base_delay: DEFAULT_BASE_DELAY,
        })
    }

    /// Override the first backoff delay
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Delay before the retry that follows attempt `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn post_once(&self, sample: &TelemetrySample) -> Result<Option<i64>> {
        let response = self
            .http
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(sample)
            .send()
            .await
            .map_err(|e| NimbusError::Delivery(format!("Failed to send request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NimbusError::Delivery(format!(
                "Server returned {}: {}",
                status, body
            )));
        }

        // Accepted even when the body is not what we expect
        Ok(response
            .json::<IngestResponse>()
            .await
            .ok()
            .and_then(|r| r.event_id))
    }

    #[instrument(skip_all, fields(client_id = %sample.client_id, event_type = %sample.event_type))]
    async fn deliver(&self, sample: &TelemetrySample, cancel: &CancellationToken) -> bool {
        self.retry(cancel, || self.post_once(sample)).await
    }

    /// Run `attempt_once` up to `max_retries + 1` times with backoff between tries
    async fn retry<F, Fut>(&self, cancel: &CancellationToken, attempt_once: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<i64>>>,
    {
        for attempt in 0..=self.max_retries {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Delivery cancelled during attempt {}", attempt + 1);
                    return false;
                }
                outcome = attempt_once() => outcome,
            };

            let err = match outcome {
                Ok(event_id) => {
                    match event_id {
                        Some(id) => info!("Sample delivered as event {}", id),
                        None => info!("Sample delivered"),
                    }
                    return true;
                }
                Err(e) => e,
            };

            if attempt == self.max_retries {
                warn!(
                    "Delivery attempt {}/{} failed, dropping sample: {}",
                    attempt + 1,
                    self.max_retries + 1,
                    err
                );
                break;
            }

            let delay = self.backoff_delay(attempt);
            warn!(
                "Delivery attempt {}/{} failed: {}. Retrying in {:?}",
                attempt + 1,
                self.max_retries + 1,
                err,
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Delivery cancelled during backoff");
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        false
    }
}

#[async_trait]
impl TelemetrySink for DeliveryClient {
    async fn send(&self, sample: &TelemetrySample, cancel: &CancellationToken) -> bool {
        self.deliver(sample, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use nimbus_core::{EventType, Metadata, SampleStatus};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Ingest {
        attempts: AtomicUsize,
        fail_first: usize,
    }

    async fn ingest(
        State(state): State<Arc<Ingest>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let n = state.attempts.fetch_add(1, Ordering::SeqCst);
        if headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) != Some("secret") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})));
        }
        if n < state.fail_first {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server error"})),
            );
        }
        assert_eq!(body["client_id"], "PC1-SN123");
        (
            StatusCode::CREATED,
            Json(json!({"success": true, "message": "ok", "event_id": 7})),
        )
    }

    async fn spawn_server(fail_first: usize) -> (String, Arc<Ingest>) {
        let state = Arc::new(Ingest {
            attempts: AtomicUsize::new(0),
            fail_first,
        });
        let app = Router::new()
            .route(TELEMETRY_PATH, post(ingest))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), state)
    }

    fn client(endpoint: &str, api_key: &str) -> DeliveryClient {
        let settings = AgentSettings {
            api_endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            max_retries: 3,
            ..Default::default()
        };
        DeliveryClient::new(&settings)
            .unwrap()
            .with_base_delay(Duration::from_millis(10))
    }

    fn sample() -> TelemetrySample {
        TelemetrySample {
            client_id: "PC1-SN123".to_string(),
            device_name: "PC1".to_string(),
            deployment_profile: "Standard".to_string(),
            phase_name: "Device Setup".to_string(),
            event_type: EventType::Progress,
            event_timestamp: Utc::now(),
            progress_percentage: 20,
            status: SampleStatus::InProgress,
            duration_seconds: 60,
            error_message: None,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = AgentSettings::default();
        let client = DeliveryClient::new(&settings).unwrap();
        assert_eq!(client.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(client.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(client.backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_url_joins_endpoint() {
        let settings = AgentSettings {
            api_endpoint: "https://telemetry.example.com/".to_string(),
            ..Default::default()
        };
        let client = DeliveryClient::new(&settings).unwrap();
        assert_eq!(client.url(), "https://telemetry.example.com/api/telemetry");
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let (endpoint, state) = spawn_server(0).await;
        let delivered = client(&endpoint, "secret")
            .send(&sample(), &CancellationToken::new())
            .await;

        assert!(delivered);
        assert_eq!(state.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let (endpoint, state) = spawn_server(2).await;
        let delivered = client(&endpoint, "secret")
            .send(&sample(), &CancellationToken::new())
            .await;

        assert!(delivered);
        assert_eq!(state.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (endpoint, state) = spawn_server(usize::MAX).await;
        let delivered = client(&endpoint, "secret")
            .send(&sample(), &CancellationToken::new())
            .await;

        assert!(!delivered);
        assert_eq!(state.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejected_key_is_a_failure() {
        let (endpoint, state) = spawn_server(0).await;
        let delivered = client(&endpoint, "wrong")
            .send(&sample(), &CancellationToken::new())
            .await;

        assert!(!delivered);
        assert_eq!(state.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancelled_backoff_stops_retrying() {
        let (endpoint, state) = spawn_server(usize::MAX).await;
        let client = client(&endpoint, "secret").with_base_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let delivered = client.send(&sample(), &cancel).await;
        assert!(!delivered);
        assert_eq!(state.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_one_two_four_seconds() {
        let client = client("http://127.0.0.1:1", "secret").with_base_delay(Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let attempts = std::sync::Mutex::new(Vec::new());

        let delivered = client
            .retry(&CancellationToken::new(), || {
                attempts.lock().unwrap().push(started.elapsed());
                async { Err(NimbusError::Delivery("Server returned 500".to_string())) }
            })
            .await;

        assert!(!delivered);
        let offsets: Vec<u64> = attempts.lock().unwrap().iter().map(|d| d.as_secs()).collect();
        assert_eq!(offsets, vec![0, 1, 3, 7]);
        assert_eq!(started.elapsed().as_secs(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_first_success() {
        let client = client("http://127.0.0.1:1", "secret").with_base_delay(Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let calls = AtomicUsize::new(0);

        let delivered = client
            .retry(&CancellationToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(NimbusError::Delivery("timed out".to_string()))
                    } else {
                        Ok(Some(42))
                    }
                }
            })
            .await;

        assert!(delivered);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed().as_secs(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let delivered = client(&format!("http://{}", addr), "secret")
            .send(&sample(), &CancellationToken::new())
            .await;
        assert!(!delivered);
    }
}
