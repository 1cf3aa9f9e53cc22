use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{field, instrument, Span};

use crate::util::crypto::{expiry_after, sas_token, SasError};
use crate::util::http::{Client, ClientError, Method, Response, StatusCode, Uri};
use crate::util::interrupt::Interrupt;

/// How a transport proves its identity to the hub.
#[derive(Clone, Debug)]
pub enum Auth {
    /// The TLS client certificate carries the proof; no header is sent.
    Identity,

    /// Mint a fresh shared-access signature for every request.
    Sas {
        resource: String,
        key: String,
        policy: Option<String>,
        ttl: Duration,
    },
}

impl Auth {
    pub(crate) fn header(&self) -> Result<Option<String>, SasError> {
        match self {
            Auth::Identity => Ok(None),
            Auth::Sas {
                resource,
                key,
                policy,
                ttl,
            } => sas_token(resource, key, policy.as_deref(), expiry_after(*ttl)).map(Some),
        }
    }
}

/// Behavior of a transport: timeouts, rate limiting, backoff and the
/// retry budget for transient failures.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    /// Maximum time to wait for a single request to complete.
    pub timeout: Duration,
    /// Minimum time between consecutive requests.
    pub min_interval: Duration,
    /// Cap for the exponential backoff after transient errors.
    pub max_backoff: Duration,
    /// Total attempts before a transient failure becomes an error.
    pub max_attempts: u32,
    pub auth: Auth,
}

/// Transient failure bookkeeping shared by [Get] and [Push].
struct RequestState {
    client: Client,
    endpoint: Uri,
    config: RequestConfig,
    next_allowed: Option<Instant>,
    backoff: Duration,
}

enum TryError {
    /// Transient; caller decides whether the attempt budget allows a retry.
    Transient(String),
    /// Permanent; returned to the caller as-is.
    Status(StatusCode),
    Decode(ClientError),
    Auth(SasError),
}

impl RequestState {
    fn new(client: Client, endpoint: Uri, config: RequestConfig) -> Self {
        let backoff = config.min_interval;
        Self {
            client,
            endpoint,
            config,
            next_allowed: None,
            backoff,
        }
    }

    fn reset_backoff(&mut self) {
        self.backoff = self.config.min_interval;
    }

    fn record_success(&mut self) {
        self.backoff = self.config.min_interval;
        self.next_allowed = Some(Instant::now() + self.config.min_interval);
    }

    fn record_failure(&mut self, retry_after: Option<Duration>) {
        let wait = if let Some(wait) = retry_after {
            wait
        } else {
            self.backoff = std::cmp::min(self.backoff * 2, self.config.max_backoff);
            self.backoff
        };
        self.next_allowed = Some(Instant::now() + wait);
    }

    fn parse_retry_after(response: &Response) -> Option<Duration> {
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    async fn wait_for_rate_limit(&mut self) {
        if let Some(allowed) = self.next_allowed {
            if Instant::now() < allowed {
                tokio::time::sleep_until(allowed.into()).await;
            }
        }
        // keep the interval even if the in-flight future is dropped
        self.next_allowed = Some(Instant::now() + self.config.min_interval);
    }
}

/// GET response: the parsed body, and whether it changed since the last
/// fetch (`false` on 304 Not Modified, where the cached body is returned).
#[derive(Debug, Clone)]
pub struct GetResponse {
    pub value: Option<serde_json::Value>,
    pub modified: bool,
}

#[derive(Debug, Error)]
pub enum GetError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("failed to decode response: {0}")]
    Decode(ClientError),

    #[error(transparent)]
    Auth(#[from] SasError),

    #[error("giving up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("cancelled")]
    Cancelled,
}

/// Etag-revalidating GET transport for a single endpoint.
///
/// The etag and last body are kept in memory for the lifetime of the
/// transport; an unchanged document is reported with `modified: false`.
pub struct Get {
    state: RequestState,
    etag: Option<String>,
    cached: Option<serde_json::Value>,
}

impl Get {
    pub fn new(client: Client, endpoint: Uri, config: RequestConfig) -> Self {
        Self {
            state: RequestState::new(client, endpoint, config),
            etag: None,
            cached: None,
        }
    }

    async fn try_get(&mut self) -> Result<GetResponse, TryError> {
        self.state.wait_for_rate_limit().await;

        let auth = self.state.config.auth.header().map_err(TryError::Auth)?;
        let response = self
            .state
            .client
            .request(Method::GET, &self.state.endpoint, |mut request| {
                if let Some(token) = &auth {
                    request = request.header("Authorization", token);
                }
                if let Some(etag) = &self.etag {
                    request = request.header("If-None-Match", etag);
                }
                Ok(request)
            })
            .await
            .map_err(|e| {
                self.state.record_failure(None);
                TryError::Transient(e.to_string())
            })?;

        let status = response.status();
        match status {
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get("etag")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);

                let json: serde_json::Value =
                    response.json().await.map_err(TryError::Decode)?;

                self.etag = etag;
                self.cached = Some(json.clone());
                self.state.record_success();

                Ok(GetResponse {
                    value: Some(json),
                    modified: true,
                })
            }
            StatusCode::NOT_MODIFIED => {
                self.state.record_success();
                Ok(GetResponse {
                    value: self.cached.clone(),
                    modified: false,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(TryError::Status(status))
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                let retry_after = RequestState::parse_retry_after(&response);
                self.state.record_failure(retry_after);
                Err(TryError::Transient(format!("server responded with {status}")))
            }
            _ => {
                self.state.record_failure(None);
                Err(TryError::Transient(format!("server responded with {status}")))
            }
        }
    }

    /// Fetch the document, retrying transient failures within the
    /// configured attempt budget. Cancellable via `interrupt`.
    #[instrument(level = "debug", skip_all, fields(retries = field::Empty))]
    pub async fn get(&mut self, interrupt: Option<Interrupt>) -> Result<GetResponse, GetError> {
        let interrupt = interrupt.unwrap_or_default();
        // the previous request may have been dropped mid-backoff
        self.state.reset_backoff();

        let mut attempts = 1;
        loop {
            let result = tokio::select! {
                res = self.try_get() => res,
                _ = interrupt.wait() => return Err(GetError::Cancelled),
            };

            match result {
                Ok(response) => {
                    Span::current().record("retries", attempts - 1);
                    return Ok(response);
                }
                Err(TryError::Transient(reason)) => {
                    if attempts >= self.state.config.max_attempts {
                        return Err(GetError::RetriesExhausted { attempts, reason });
                    }
                    attempts += 1;
                }
                Err(TryError::Status(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)) => {
                    return Err(GetError::Unauthorized)
                }
                Err(TryError::Status(_)) => return Err(GetError::NotFound),
                Err(TryError::Decode(e)) => return Err(GetError::Decode(e)),
                Err(TryError::Auth(e)) => return Err(GetError::Auth(e)),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("server replied with status {0}")]
    Status(u16),

    #[error(transparent)]
    Auth(#[from] SasError),

    #[error("giving up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("cancelled")]
    Cancelled,
}

/// Best-effort JSON sender (PATCH or POST) for a single endpoint.
///
/// Transient failures are retried with capped backoff up to the attempt
/// budget; 4xx responses are permanent and returned immediately. Delivery
/// is never guaranteed, matching the publisher contract.
pub struct Push {
    state: RequestState,
    method: Method,
    content_type: Option<&'static str>,
}

impl Push {
    pub fn patch(client: Client, endpoint: Uri, config: RequestConfig) -> Self {
        Self {
            state: RequestState::new(client, endpoint, config),
            method: Method::PATCH,
            content_type: None,
        }
    }

    pub fn post(client: Client, endpoint: Uri, config: RequestConfig) -> Self {
        Self {
            state: RequestState::new(client, endpoint, config),
            method: Method::POST,
            content_type: None,
        }
    }

    /// Override the `Content-Type` sent with the body.
    pub fn content_type(mut self, value: &'static str) -> Self {
        self.content_type = Some(value);
        self
    }

    async fn try_send(&mut self, body: &serde_json::Value) -> Result<(), TryError> {
        self.state.wait_for_rate_limit().await;

        let auth = self.state.config.auth.header().map_err(TryError::Auth)?;
        let response = self
            .state
            .client
            .request(self.method.clone(), &self.state.endpoint, |mut request| {
                request = request.json(body);
                if let Some(content_type) = self.content_type {
                    request = request.header("Content-Type", content_type);
                }
                if let Some(token) = &auth {
                    request = request.header("Authorization", token);
                }
                Ok(request)
            })
            .await
            .map_err(|e| {
                self.state.record_failure(None);
                TryError::Transient(e.to_string())
            })?;

        let status = response.status();
        match status {
            status if status.is_success() => {
                self.state.record_success();
                Ok(())
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                let retry_after = RequestState::parse_retry_after(&response);
                self.state.record_failure(retry_after);
                Err(TryError::Transient(format!("server responded with {status}")))
            }
            status if status.is_server_error() => {
                self.state.record_failure(None);
                Err(TryError::Transient(format!("server responded with {status}")))
            }
            _ => {
                // remaining 4xx are permanent, don't burn the backoff on them
                self.state.record_success();
                Err(TryError::Status(status))
            }
        }
    }

    /// Send `body`, retrying transient failures within the attempt
    /// budget. Cancellable via `interrupt`.
    #[instrument(level = "debug", skip_all, fields(retries = field::Empty))]
    pub async fn send(
        &mut self,
        body: &serde_json::Value,
        interrupt: Option<Interrupt>,
    ) -> Result<(), PushError> {
        let interrupt = interrupt.unwrap_or_default();
        self.state.reset_backoff();

        let mut attempts = 1;
        loop {
            let result = tokio::select! {
                res = self.try_send(body) => res,
                _ = interrupt.wait() => return Err(PushError::Cancelled),
            };

            match result {
                Ok(()) => {
                    Span::current().record("retries", attempts - 1);
                    return Ok(());
                }
                Err(TryError::Transient(reason)) => {
                    if attempts >= self.state.config.max_attempts {
                        return Err(PushError::RetriesExhausted { attempts, reason });
                    }
                    attempts += 1;
                }
                Err(TryError::Status(status)) => return Err(PushError::Status(status.as_u16())),
                Err(TryError::Auth(e)) => return Err(PushError::Auth(e)),
                Err(TryError::Decode(_)) => unreachable!("push does not decode bodies"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn test_config() -> RequestConfig {
        RequestConfig {
            timeout: Duration::from_secs(10),
            min_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_attempts: 3,
            auth: Auth::Identity,
        }
    }

    fn sas_config() -> RequestConfig {
        RequestConfig {
            auth: Auth::Sas {
                resource: "hub.example.com".into(),
                key: "c2VjcmV0LWtleQ==".into(),
                policy: None,
                ttl: Duration::from_secs(3600),
            },
            ..test_config()
        }
    }

    fn client() -> Client {
        Client::new(Some(Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_get_basic() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"maxTemperature": 30}"#)
            .create_async()
            .await;

        let mut get = Get::new(client(), endpoint, test_config());
        let response = get.get(None).await.unwrap();

        assert_eq!(response.value, Some(json!({"maxTemperature": 30})));
        assert!(response.modified);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_sends_sas_header() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/")
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature sr=.*&sig=.*&se=".into()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let mut get = Get::new(client(), endpoint, sas_config());
        get.get(None).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_etag_revalidation() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let first = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("etag", "\"v1\"")
            .with_body(r#"{"maxTemperature": 30}"#)
            .create_async()
            .await;

        let mut get = Get::new(client(), endpoint, test_config());
        let response = get.get(None).await.unwrap();
        assert!(response.modified);
        first.assert_async().await;

        let second = server
            .mock("GET", "/")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .create_async()
            .await;

        let response = get.get(None).await.unwrap();
        assert!(!response.modified);
        assert_eq!(response.value, Some(json!({"maxTemperature": 30})));
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_unauthorized_is_permanent() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let mut get = Get::new(client(), endpoint, test_config());
        let result = get.get(None).await;

        assert!(matches!(result, Err(GetError::Unauthorized)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_retries_server_errors() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let failures = server
            .mock("GET", "/")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;
        let success = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let mut get = Get::new(client(), endpoint, test_config());
        let response = get.get(None).await.unwrap();

        assert_eq!(response.value, Some(json!({"ok": true})));
        failures.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_attempt_budget() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let mut get = Get::new(client(), endpoint, test_config());
        let result = get.get(None).await;

        assert!(matches!(
            result,
            Err(GetError::RetriesExhausted { attempts: 3, .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_cancellation() {
        let server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mut get = Get::new(client(), endpoint, test_config());

        let interrupt = Interrupt::new();
        interrupt.trigger();

        let result = get.get(Some(interrupt)).await;
        assert!(matches!(result, Err(GetError::Cancelled)));
    }

    #[tokio::test]
    async fn test_push_patch_basic() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("PATCH", "/")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"currentTemperatureC": 23.625})))
            .with_status(204)
            .create_async()
            .await;

        let mut push = Push::patch(client(), endpoint, test_config());
        push.send(&json!({"currentTemperatureC": 23.625}), None)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_content_type_override() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("POST", "/")
            .match_header("content-type", "application/json; charset=utf-8")
            .with_status(201)
            .create_async()
            .await;

        let mut push = Push::post(client(), endpoint, test_config())
            .content_type("application/json; charset=utf-8");
        push.send(&json!({"connectivity": "WiFi"}), None)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_client_error_is_permanent() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("PATCH", "/")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let mut push = Push::patch(client(), endpoint, test_config());
        let result = push.send(&json!({}), None).await;

        assert!(matches!(result, Err(PushError::Status(400))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_retries_then_succeeds() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let failure = server
            .mock("POST", "/")
            .with_status(503)
            .with_header("retry-after", "0")
            .create_async()
            .await;
        let success = server
            .mock("POST", "/")
            .with_status(200)
            .create_async()
            .await;

        let mut push = Push::post(client(), endpoint, test_config());
        push.send(&json!({"seq": 1}), None).await.unwrap();

        failure.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_attempt_budget() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("POST", "/")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let mut push = Push::post(client(), endpoint, test_config());
        let result = push.send(&json!({}), None).await;

        assert!(matches!(
            result,
            Err(PushError::RetriesExhausted { attempts: 3, .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_cancellation() {
        let server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mut push = Push::patch(client(), endpoint, test_config());

        let interrupt = Interrupt::new();
        interrupt.trigger();

        let result = push.send(&json!({}), Some(interrupt)).await;
        assert!(matches!(result, Err(PushError::Cancelled)));
    }
}
