//! HTTP client with persistent tokens and single-flight refresh on 401

use crate::config::ClientConfig;
use crate::error::{ApiError, AuthFailure, Result};
use crate::refresh::{RefreshFailure, RefreshGate, RefreshOutcome, Role};
use crate::token_store::{FileTokenStorage, TokenStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::types::AuthResponse;
use bytes::Bytes;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Endpoint exchanging a refresh token for a new token pair
pub const REFRESH_ENDPOINT: &str = "/auth/refresh-token";

/// Everything about a request except its endpoint and auth requirement
///
/// Options are borrowed by every attempt, so a request retried after a
/// refresh is byte-for-byte the same request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    /// Merged over the default `Content-Type: application/json`
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Overrides [`ClientConfig::request_timeout`] for this request
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Inner<S> {
    http: Client,
    config: ClientConfig,
    storage: S,
    refresh: RefreshGate,
}

/// Authenticated client for the Chronos API
///
/// Cheap to clone; clones share the HTTP connection pool, the token storage
/// and the refresh state, so a refresh started through one clone is joined
/// by all of them.
pub struct ApiClient<S: TokenStorage = FileTokenStorage> {
    inner: Arc<Inner<S>>,
}

impl<S: TokenStorage> Clone for ApiClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TokenStorage> ApiClient<S> {
    /// Create a new client
    ///
    /// # Arguments
    /// * `config` - Base URL and timeouts
    /// * `storage` - Where the access and refresh tokens live
    pub fn new(config: ClientConfig, storage: S) -> Result<Self> {
        config.validate()?;

        let http = Client::builder().user_agent(config.user_agent.as_str()).build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                storage,
                refresh: RefreshGate::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn base_url(&self) -> &str {
        &self.inner.config.base_url
    }

    /// Get the token storage (for advanced usage)
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Whether a token refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh.is_refreshing()
    }

    pub(crate) fn http(&self) -> &Client {
        &self.inner.http
    }

    pub(crate) fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.inner.config.base_url, endpoint)
    }

    /// Absolute URL of a photo the server stored
    ///
    /// Paths that already carry an `http://` or `https://` scheme (e.g. CDN
    /// uploads) are returned untouched; anything else is relative to the
    /// base URL.
    pub fn photo_url(&self, photo_path: Option<&str>) -> Option<String> {
        let path = photo_path.filter(|p| !p.is_empty())?;
        if path.starts_with("http://") || path.starts_with("https://") {
            return Some(path.to_string());
        }
        Some(self.url(path))
    }

    /// Stored access token; storage failures read as "no token"
    pub async fn access_token(&self) -> Option<String> {
        self.read_token(ACCESS_TOKEN_KEY).await
    }

    /// Stored refresh token; storage failures read as "no token"
    pub async fn refresh_token(&self) -> Option<String> {
        self.read_token(REFRESH_TOKEN_KEY).await
    }

    async fn read_token(&self, key: &str) -> Option<String> {
        match self.inner.storage.get(key).await {
            Ok(token) => token,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read token, continuing without it");
                None
            }
        }
    }

    /// Persist both tokens in one write; failures are logged, not returned
    pub async fn set_tokens(&self, access_token: &str, refresh_token: &str) {
        let entries = [(ACCESS_TOKEN_KEY, access_token), (REFRESH_TOKEN_KEY, refresh_token)];
        if let Err(e) = self.inner.storage.set_many(&entries).await {
            warn!(error = %e, "Failed to persist tokens");
        }
    }

    /// Forget both tokens; best effort
    pub async fn clear_tokens(&self) {
        if let Err(e) = self.inner.storage.remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]).await {
            warn!(error = %e, "Failed to clear tokens");
        }
    }

    /// Send a JSON request and decode the JSON response
    ///
    /// With `requires_auth`, the stored access token is sent as a bearer
    /// token and a 401 triggers one shared token refresh followed by a
    /// single retry of this request.
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        requires_auth: bool,
    ) -> Result<T> {
        let body = self.attempt_with_refresh(endpoint, options, requires_auth).await?;
        decode(endpoint, &body)
    }

    async fn attempt_with_refresh(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        requires_auth: bool,
    ) -> Result<Bytes> {
        let unauthorized = match self.attempt(endpoint, options, requires_auth).await {
            Err(ApiError::Http { status: 401, message }) if requires_auth && endpoint != REFRESH_ENDPOINT => {
                message
            }
            other => return other,
        };

        debug!(endpoint = %endpoint, "Got 401, refreshing tokens before retrying");
        match self.join_refresh().await {
            Ok(_) => self.attempt(endpoint, options, requires_auth).await,
            Err(failure) => {
                warn!(
                    endpoint = %endpoint,
                    reason = %failure.reason,
                    cause = %failure.detail,
                    "Token refresh failed, giving up on request"
                );
                Err(ApiError::Auth {
                    reason: failure.reason,
                    message: unauthorized,
                    cause: failure.detail,
                })
            }
        }
    }

    /// One dispatch of a JSON request, no refresh handling
    async fn attempt(&self, endpoint: &str, options: &RequestOptions, requires_auth: bool) -> Result<Bytes> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.extend(options.headers.clone());
        if requires_auth {
            if let Some(token) = self.access_token().await {
                headers.insert(AUTHORIZATION, bearer(&token)?);
            }
        }

        let mut builder = self
            .inner
            .http
            .request(options.method.clone(), self.url(endpoint))
            .headers(headers);
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(body) = &options.body {
            builder = builder.body(serde_json::to_vec(body)?);
        }

        let timeout = options.timeout.unwrap_or(self.inner.config.request_timeout);
        debug!(method = %options.method, endpoint = %endpoint, "API request");
        self.dispatch(endpoint, builder, timeout).await
    }

    /// Send a prepared request under its own timeout
    ///
    /// Only this request is dropped when the timeout fires; anything else in
    /// flight, including a pending refresh, keeps going.
    pub(crate) async fn dispatch(
        &self,
        endpoint: &str,
        builder: RequestBuilder,
        timeout: Duration,
    ) -> Result<Bytes> {
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, ApiError>((status, body))
        };

        let (status, body) = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(endpoint = %endpoint, timeout = ?timeout, "API request timed out");
                return Err(ApiError::Timeout {
                    endpoint: endpoint.to_string(),
                    after: timeout,
                });
            }
        };

        debug!(endpoint = %endpoint, status = %status.as_u16(), "API response");
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }
        Ok(body)
    }

    /// Await the in-flight refresh, starting one if there is none
    ///
    /// The refresh runs as a spawned task: a caller that stops waiting
    /// (timeout, `select!`, aborted task) does not stop the refresh, and the
    /// rotated tokens are still written to storage.
    pub(crate) async fn join_refresh(&self) -> RefreshOutcome {
        // the task holds its own handle on the client and lets go once the refresh ends
        let (refresh, role) = self.inner.refresh.claim_or_join(|| {
            let client = self.clone();
            async move {
                let outcome = client.perform_refresh().await;
                if outcome.is_err() {
                    client.clear_tokens().await;
                }
                outcome
            }
            .boxed()
        });

        if role == Role::Follower {
            debug!("Joining token refresh already in flight");
        }
        refresh.await
    }

    async fn perform_refresh(&self) -> RefreshOutcome {
        let Some(refresh_token) = self.refresh_token().await else {
            return Err(RefreshFailure::new(AuthFailure::NoRefreshToken, "No refresh token available"));
        };

        info!("Refreshing access token");
        let options = RequestOptions::post().with_json(json!({ "refreshToken": refresh_token }));
        let response = self
            .attempt(REFRESH_ENDPOINT, &options, false)
            .await
            .and_then(|body| decode::<AuthResponse>(REFRESH_ENDPOINT, &body))
            .map_err(|e| RefreshFailure::new(AuthFailure::RefreshFailed, e.to_string()))?;
        let Some(tokens) = response.tokens() else {
            return Err(RefreshFailure::new(
                AuthFailure::RefreshFailed,
                "Refresh response did not include both tokens",
            ));
        };

        self.set_tokens(&tokens.access_token, &tokens.refresh_token).await;
        info!("Access token refreshed successfully");
        Ok(tokens)
    }
}

pub(crate) fn bearer(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ApiError::Configuration("stored access token is not a valid header value".to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn decode<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidResponse(format!("{endpoint}: {e}")))
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<serde_json::Value>,
}

/// Message of an error response, with a status-based fallback
fn error_message(status: StatusCode, body: &[u8]) -> String {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .and_then(|m| match m {
            serde_json::Value::String(s) => Some(s),
            // validation errors come back as a list of messages
            serde_json::Value::Array(items) => {
                let parts: Vec<_> = items.iter().filter_map(|i| i.as_str()).collect();
                Some(parts.join(", "))
            }
            _ => None,
        })
        .filter(|m| !m.is_empty());

    message.unwrap_or_else(|| {
        if status == StatusCode::UNAUTHORIZED {
            "Unauthorized".to_string()
        } else {
            format!("HTTP error! status: {}", status.as_u16())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::token_store::MemoryTokenStorage;
    use serde_json::Value;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ApiClient<MemoryTokenStorage> {
        ApiClient::new(ClientConfig::new(server.uri()), MemoryTokenStorage::new()).unwrap()
    }

    async fn requests_to(server: &MockServer, endpoint: &str) -> Vec<wiremock::Request> {
        server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == endpoint)
            .collect()
    }

    fn time_log_json(id: &str) -> Value {
        json!({
            "id": id,
            "checkIn": "2024-05-02T08:00:00.000Z",
            "checkOut": null,
            "checkInPhoto": "/uploads/in.jpg",
            "checkOutPhoto": null,
            "checkInLatitude": -23.55,
            "checkInLongitude": -46.63,
            "checkOutLatitude": null,
            "checkOutLongitude": null
        })
    }

    async fn mount_expired_time_logs(server: &MockServer, fresh_token: &str) {
        Mock::given(method("GET"))
            .and(path("/timelog"))
            .and(header("Authorization", format!("Bearer {fresh_token}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([time_log_json("log-1")])))
            .with_priority(1)
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/timelog"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Token expired" })))
            .mount(server)
            .await;
    }

    /// Storage whose every operation fails
    struct BrokenStorage;

    fn broken() -> StorageError {
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
    }

    impl TokenStorage for BrokenStorage {
        async fn get(&self, _key: &str) -> std::result::Result<Option<String>, StorageError> {
            Err(broken())
        }

        async fn set_many(&self, _entries: &[(&str, &str)]) -> std::result::Result<(), StorageError> {
            Err(broken())
        }

        async fn remove_many(&self, _keys: &[&str]) -> std::result::Result<(), StorageError> {
            Err(broken())
        }
    }

    #[tokio::test]
    async fn test_token_round_trip() {
        let server = MockServer::start().await;
        let client = client_for(&server);

        client.set_tokens("a", "b").await;
        assert_eq!(client.access_token().await.as_deref(), Some("a"));
        assert_eq!(client.refresh_token().await.as_deref(), Some("b"));

        client.clear_tokens().await;
        assert!(client.access_token().await.is_none());
        assert!(client.refresh_token().await.is_none());
    }

    #[tokio::test]
    async fn test_sends_bearer_and_json_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/profile"))
            .and(header("Authorization", "Bearer access-1"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_tokens("access-1", "refresh-1").await;

        let body: Value = client.request("/auth/profile", &RequestOptions::get(), true).await.unwrap();
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_caller_headers_override_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("Content-Type", "text/plain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let options = RequestOptions::post()
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .with_json(json!("hello"));

        let _: Value = client.request("/echo", &options, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthenticated_request_skips_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_tokens("access-1", "refresh-1").await;

        let _: Value = client
            .request("/auth/login", &RequestOptions::post().with_json(json!({})), false)
            .await
            .unwrap();

        let sent = requests_to(&server, "/auth/login").await;
        assert!(sent[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_http_error_uses_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/company"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "Company not found" })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.request::<Value>("/company", &RequestOptions::get(), false).await.unwrap_err();

        match err {
            ApiError::Http { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Company not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_error_fallback_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.request::<Value>("/boom", &RequestOptions::get(), false).await.unwrap_err();

        assert_eq!(err.status(), Some(502));
        assert_eq!(err.to_string(), "HTTP 502: HTTP error! status: 502");
    }

    #[test]
    fn test_error_message_joins_validation_list() {
        let body = serde_json::to_vec(&json!({ "message": ["email must be an email", "password too short"] })).unwrap();
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, &body),
            "email must be an email, password too short"
        );
        assert_eq!(error_message(StatusCode::UNAUTHORIZED, b""), "Unauthorized");
    }

    #[tokio::test]
    async fn test_invalid_success_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/timelog"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.request::<Value>("/timelog", &RequestOptions::get(), false).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let server = MockServer::start().await;
        mount_expired_time_logs(&server, "access-2").await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .and(body_json(json!({ "refreshToken": "refresh-1" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessToken": "access-2", "refreshToken": "refresh-2" }))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_tokens("access-1", "refresh-1").await;

        let (a, b, c) = tokio::join!(client.time_logs(), client.time_logs(), client.time_logs());

        for logs in [a, b, c] {
            let logs = logs.unwrap();
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].id, "log-1");
        }
        assert_eq!(requests_to(&server, REFRESH_ENDPOINT).await.len(), 1);
        assert_eq!(requests_to(&server, "/timelog").await.len(), 6);
        assert_eq!(client.access_token().await.as_deref(), Some("access-2"));
        assert_eq!(client.refresh_token().await.as_deref(), Some("refresh-2"));
        assert!(!client.is_refreshing());
    }

    /// A request abandoned mid-refresh must not lose the rotated tokens.
    #[tokio::test]
    async fn test_refresh_completes_after_caller_gives_up() {
        let server = MockServer::start().await;
        mount_expired_time_logs(&server, "access-2").await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessToken": "access-2", "refreshToken": "refresh-2" }))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_tokens("access-1", "refresh-1").await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            client.request::<Value>("/timelog", &RequestOptions::get(), true),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(client.is_refreshing());

        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert!(!client.is_refreshing());
        assert_eq!(requests_to(&server, REFRESH_ENDPOINT).await.len(), 1);
        assert_eq!(client.access_token().await.as_deref(), Some("access-2"));
        assert_eq!(client.refresh_token().await.as_deref(), Some("refresh-2"));
    }

    /// Dropping every handle to the client while a refresh runs frees it.
    #[tokio::test]
    async fn test_refresh_task_releases_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessToken": "access-2", "refreshToken": "refresh-2" }))
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;

        let storage = MemoryTokenStorage::new();
        let client = ApiClient::new(ClientConfig::new(server.uri()), storage.clone()).unwrap();
        client.set_tokens("access-1", "refresh-1").await;
        let weak = Arc::downgrade(&client.inner);

        let waited = tokio::time::timeout(Duration::from_millis(20), client.join_refresh()).await;
        assert!(waited.is_err());
        drop(client);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(weak.upgrade().is_none());
        assert_eq!(storage.get(REFRESH_TOKEN_KEY).await.unwrap().as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_fails_all_waiters_with_original_401() {
        let server = MockServer::start().await;
        mount_expired_time_logs(&server, "never-issued").await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({ "message": "Invalid refresh token" }))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_tokens("access-1", "refresh-1").await;

        let options = RequestOptions::get();
        let (a, b) = tokio::join!(
            client.request::<Value>("/timelog", &options, true),
            client.request::<Value>("/timelog", &options, true),
        );

        for result in [a, b] {
            match result.unwrap_err() {
                ApiError::Auth { reason, message, cause } => {
                    assert_eq!(reason, AuthFailure::RefreshFailed);
                    assert_eq!(message, "Token expired");
                    assert!(cause.contains("Invalid refresh token"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(requests_to(&server, REFRESH_ENDPOINT).await.len(), 1);
        assert!(client.access_token().await.is_none());
        assert!(client.refresh_token().await.is_none());
        assert!(!client.is_refreshing());
    }

    #[tokio::test]
    async fn test_retry_401_does_not_refresh_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/timelog"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Still unauthorized" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessToken": "access-2", "refreshToken": "refresh-2" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_tokens("access-1", "refresh-1").await;

        let err = client.request::<Value>("/timelog", &RequestOptions::get(), true).await.unwrap_err();

        match err {
            ApiError::Http { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Still unauthorized");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(requests_to(&server, REFRESH_ENDPOINT).await.len(), 1);
        assert_eq!(requests_to(&server, "/timelog").await.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_endpoint_never_refreshes_itself() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Invalid refresh token" })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_tokens("access-1", "refresh-1").await;

        let options = RequestOptions::post().with_json(json!({ "refreshToken": "refresh-1" }));
        let err = client.request::<Value>(REFRESH_ENDPOINT, &options, true).await.unwrap_err();

        assert!(matches!(err, ApiError::Http { status: 401, .. }));
        assert_eq!(requests_to(&server, REFRESH_ENDPOINT).await.len(), 1);
        assert_eq!(client.refresh_token().await.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_no_tokens_profile_fails_without_refresh_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/profile"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Missing token" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.access_token().await.is_none());

        let err = client.request::<Value>("/auth/profile", &RequestOptions::get(), true).await.unwrap_err();

        assert_eq!(err.auth_failure(), Some(AuthFailure::NoRefreshToken));
        assert_eq!(err.to_string(), "Missing token");
        let sent = requests_to(&server, "/auth/profile").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].headers.get("authorization").is_none());
        assert!(client.storage().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_allowed_again_after_failure() {
        let server = MockServer::start().await;
        mount_expired_time_logs(&server, "access-2").await;
        Mock::given(method("POST"))
            .and(path(REFRESH_ENDPOINT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessToken": "access-2", "refreshToken": "refresh-2" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let first = client.request::<Value>("/timelog", &RequestOptions::get(), true).await;
        assert_eq!(first.unwrap_err().auth_failure(), Some(AuthFailure::NoRefreshToken));
        assert!(!client.is_refreshing());

        client.set_tokens("access-1", "refresh-1").await;
        let second: Value = client.request("/timelog", &RequestOptions::get(), true).await.unwrap();
        assert_eq!(second[0]["id"], "log-1");
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_other_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fast"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ok": true }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let slow_options = RequestOptions::get().with_timeout(Duration::from_millis(100));
        let fast_options = RequestOptions::get();

        let (slow, fast) = tokio::join!(
            client.request::<Value>("/slow", &slow_options, false),
            client.request::<Value>("/fast", &fast_options, false),
        );

        match slow.unwrap_err() {
            ApiError::Timeout { endpoint, after } => {
                assert_eq!(endpoint, "/slow");
                assert_eq!(after, Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fast.unwrap(), json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let client = ApiClient::new(ClientConfig::new("http://127.0.0.1:1"), MemoryTokenStorage::new()).unwrap();

        let err = client.request::<Value>("/timelog", &RequestOptions::get(), false).await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
    }

    #[tokio::test]
    async fn test_storage_failures_are_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/timelog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = ApiClient::new(ClientConfig::new(server.uri()), BrokenStorage).unwrap();
        client.set_tokens("a", "b").await;
        client.clear_tokens().await;
        assert!(client.access_token().await.is_none());

        let logs: Value = client.request("/timelog", &RequestOptions::get(), true).await.unwrap();
        assert_eq!(logs, json!([]));
        let sent = requests_to(&server, "/timelog").await;
        assert!(sent[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_photo_url() {
        let client = ApiClient::new(ClientConfig::new("http://10.0.2.2:8000"), MemoryTokenStorage::new()).unwrap();

        assert_eq!(
            client.photo_url(Some("/uploads/a.jpg")).as_deref(),
            Some("http://10.0.2.2:8000/uploads/a.jpg")
        );
        assert_eq!(
            client.photo_url(Some("https://cdn.example.com/a.jpg")).as_deref(),
            Some("https://cdn.example.com/a.jpg")
        );
        assert_eq!(client.photo_url(Some("")), None);
        assert_eq!(client.photo_url(None), None);
    }
}
