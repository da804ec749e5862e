//! Data access gateway: HTTP handlers and the per-request pipeline.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::response::{
    apply_rate_limit_headers, content_etag, http_date, is_not_modified, ApiError,
};
use super::store::{DataFile, DataStore};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::ratelimit::{
    EndpointDescriptor, EndpointRegistry, RateLimitService, Tier, UsageLog, UsageStatus,
};
use crate::security::{
    bearer_token, SanitizedPath, SecurePathResolver, SecurityContext, TokenError, TokenValidator,
};

/// Route prefix of dataset requests; the remainder is the raw dataset path.
pub const DATA_ROUTE_PREFIX: &str = "/api/v1/data/";

/// Endpoint charged for dataset requests no configured rule matches.
const DATA_ENDPOINT_PATTERN: &str = "/api/v1/data";

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Everything the handlers need, built once at startup.
pub struct GatewayState {
    rate_limiter: Arc<RateLimitService>,
    resolver: SecurePathResolver,
    /// Endpoint rules, replaceable at runtime
    registry: RwLock<EndpointRegistry>,
    data_endpoint: EndpointDescriptor,
    token_validator: Arc<dyn TokenValidator>,
    store: Arc<dyn DataStore>,
    admin_users: HashSet<String>,
    cache_max_age_secs: u64,
}

/// Shared handler state.
pub type AppState = Arc<GatewayState>;

impl GatewayState {
    /// Build the state from configuration and the injected collaborators.
    pub fn from_config(
        config: &GatewayConfig,
        usage_log: Arc<dyn UsageLog>,
        store: Arc<dyn DataStore>,
    ) -> Result<Self> {
        let catalog = config.tier_catalog()?;
        Ok(Self {
            rate_limiter: Arc::new(RateLimitService::new(usage_log, catalog)),
            resolver: SecurePathResolver::new(config.access_policy()),
            registry: RwLock::new(config.endpoint_registry()?),
            data_endpoint: EndpointDescriptor::new("GET", DATA_ENDPOINT_PATTERN, Tier::lowest())?,
            token_validator: Arc::new(config.token_validator()?),
            store,
            admin_users: config.security.admin_users.iter().cloned().collect(),
            cache_max_age_secs: config.data.cache_max_age_secs,
        })
    }

    /// The rate limit service.
    pub fn rate_limiter(&self) -> &Arc<RateLimitService> {
        &self.rate_limiter
    }

    /// Replace the endpoint rules. Requests in flight keep the descriptor
    /// they already resolved.
    pub fn reload_endpoints(&self, registry: EndpointRegistry) {
        let count = registry.len();
        *self.registry.write() = registry;
        info!(endpoints = count, "Endpoint rules reloaded");
    }

    fn endpoint_for(&self, path: &str) -> EndpointDescriptor {
        self.registry
            .read()
            .find("GET", path)
            .cloned()
            .unwrap_or_else(|| self.data_endpoint.clone())
    }

    /// Requests without an `Authorization` header are anonymous; a present
    /// but invalid header is rejected.
    async fn authenticate(&self, headers: &HeaderMap, request_id: &str) -> Result<SecurityContext> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(SecurityContext::anonymous(request_id));
        };

        let value = value
            .to_str()
            .map_err(|_| GatewayError::Unauthenticated(TokenError::Malformed.to_string()))?;
        let token =
            bearer_token(value).map_err(|e| GatewayError::Unauthenticated(e.to_string()))?;

        let user = self.token_validator.validate(token).await.map_err(|e| {
            debug!(request_id = %request_id, error = %e, "Token rejected");
            GatewayError::Unauthenticated(e.to_string())
        })?;

        Ok(SecurityContext::authenticated(user, request_id))
    }
}

/// Build the router with all routes and the trace layer.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/data/{*path}", get(get_dataset))
        .route("/api/v1/ratelimit/status", get(get_rate_limit_status))
        .route("/api/v1/admin/ratelimit/{user_id}", delete(reset_rate_limit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetMetadata {
    path: String,
    size: usize,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DatasetResponse {
    data: serde_json::Value,
    metadata: DatasetMetadata,
}

async fn get_dataset(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let response = match serve_dataset(&state, &uri, &headers, &request_id).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    with_request_id(response, &request_id)
}

/// Authenticate, check tier and rate, validate the path, authorize, serve,
/// and charge the request only when the response is a 2xx.
#[instrument(skip_all, fields(request_id = %request_id))]
async fn serve_dataset(
    state: &GatewayState,
    uri: &Uri,
    headers: &HeaderMap,
    request_id: &str,
) -> std::result::Result<Response, ApiError> {
    let ctx = state
        .authenticate(headers, request_id)
        .await
        .map_err(|e| ApiError::new(e, request_id))?;
    let subject = ctx.rate_limit_subject();
    let endpoint = state.endpoint_for(uri.path());

    let status = state
        .rate_limiter
        .check_limit(&subject, &endpoint)
        .await
        .map_err(|e| ApiError::new(e, request_id))?;
    if !status.allowed {
        warn!(
            user_id = %subject.user_id,
            endpoint = %endpoint.key(),
            limit = status.limit.max_requests(),
            "Request rate limited"
        );
        return Err(ApiError::rate_limited(status, request_id, Utc::now()));
    }

    let raw_path = uri.path().strip_prefix(DATA_ROUTE_PREFIX).unwrap_or_default();
    let path = state
        .resolver
        .validate_and_sanitize(raw_path, &ctx)
        .and_then(|path| {
            state.resolver.check_access(&path, &ctx).into_result()?;
            Ok(path)
        })
        .map_err(|e| ApiError::new(e, request_id).with_rate_status(status))?;

    let file = state
        .store
        .fetch(&path)
        .await
        .map_err(|e| ApiError::new(e, request_id).with_rate_status(status))?;

    let mut response = render_dataset(&path, file, headers, state.cache_max_age_secs)
        .map_err(|e| ApiError::new(e, request_id).with_rate_status(status))?;
    apply_rate_limit_headers(response.headers_mut(), &status);

    if response.status().is_success() {
        if let Err(e) = state.rate_limiter.record_usage(&subject, &endpoint).await {
            warn!(user_id = %subject.user_id, error = %e, "Failed to record usage");
        }
    } else {
        debug!(status = %response.status(), "Response not charged");
    }

    Ok(response)
}

fn render_dataset(
    path: &SanitizedPath,
    file: DataFile,
    request_headers: &HeaderMap,
    cache_max_age_secs: u64,
) -> Result<Response> {
    let etag = content_etag(&file.contents);

    let mut response = if is_not_modified(request_headers, &etag, file.last_modified) {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        let data: serde_json::Value = serde_json::from_slice(&file.contents).map_err(|e| {
            GatewayError::Internal(format!("dataset {} is not valid JSON: {}", path, e))
        })?;
        Json(DatasetResponse {
            data,
            metadata: DatasetMetadata {
                path: path.to_string(),
                size: file.contents.len(),
                etag: etag.clone(),
                last_modified: file.last_modified,
            },
        })
        .into_response()
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(file.last_modified)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("private, max-age={}", cache_max_age_secs)) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    Ok(response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitStatusResponse {
    user_id: String,
    tier: Tier,
    #[serde(flatten)]
    usage: UsageStatus,
}

async fn get_rate_limit_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let response = match usage_status(&state, &headers, &request_id).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    with_request_id(response, &request_id)
}

async fn usage_status(
    state: &GatewayState,
    headers: &HeaderMap,
    request_id: &str,
) -> std::result::Result<Response, ApiError> {
    let ctx = state
        .authenticate(headers, request_id)
        .await
        .map_err(|e| ApiError::new(e, request_id))?;
    let subject = ctx.rate_limit_subject();

    let usage = state
        .rate_limiter
        .get_usage_status(&subject)
        .await
        .map_err(|e| ApiError::new(e, request_id))?;

    Ok(Json(RateLimitStatusResponse {
        user_id: subject.user_id,
        tier: subject.tier,
        usage,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetResponse {
    user_id: String,
    removed_records: usize,
}

async fn reset_rate_limit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let response = match reset_usage(&state, &user_id, &headers, &request_id).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    with_request_id(response, &request_id)
}

async fn reset_usage(
    state: &GatewayState,
    user_id: &str,
    headers: &HeaderMap,
    request_id: &str,
) -> std::result::Result<Response, ApiError> {
    let ctx = state
        .authenticate(headers, request_id)
        .await
        .map_err(|e| ApiError::new(e, request_id))?;

    let Some(caller) = ctx.user() else {
        return Err(ApiError::new(
            GatewayError::Unauthenticated("admin endpoints require a bearer token".to_string()),
            request_id,
        ));
    };
    if !state.admin_users.contains(&caller.user_id) {
        warn!(request_id = %request_id, caller = %caller.user_id, "Rejected admin request");
        return Err(ApiError::new(
            GatewayError::Forbidden("admin privileges required".to_string()),
            request_id,
        ));
    }

    let removed_records = state
        .rate_limiter
        .reset_limit(user_id)
        .await
        .map_err(|e| ApiError::new(e, request_id))?;

    info!(caller = %caller.user_id, user_id = %user_id, removed_records, "Usage reset by admin");
    Ok(Json(ResetResponse {
        user_id: user_id.to_string(),
        removed_records,
    })
    .into_response())
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::response::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_WARNING};
    use crate::ratelimit::{InMemoryUsageLog, UsageLogError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const CONFIG: &str = r#"
rate_limiting:
  tiers:
    - tier: tier1
      max_requests: 5
      window_seconds: 60
  endpoints:
    - path: /api/v1/data/premium/*
      required_tier: tier3
security:
  tokens:
    - token: t-alice
      user_id: alice
      tier: tier1
    - token: t-bob
      user_id: bob
      tier: tier2
    - token: t-root
      user_id: root
      tier: tier3
  admin_users: [root]
"#;

    fn modified_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    /// Dataset store backed by a map, optionally failing the first fetches.
    struct MemoryStore {
        files: HashMap<String, Vec<u8>>,
        failures: AtomicUsize,
    }

    impl MemoryStore {
        fn new() -> Self {
            let files = [
                ("public/a.json", r#"{"k":1}"#),
                ("private/p.json", r#"{"p":2}"#),
                ("secure/s.json", r#"{"s":true}"#),
                ("premium/x.json", r#"[1,2,3]"#),
                ("public/broken.json", "not json"),
            ]
            .into_iter()
            .map(|(path, contents)| (path.to_string(), contents.as_bytes().to_vec()))
            .collect();
            Self {
                files,
                failures: AtomicUsize::new(0),
            }
        }

        fn failing_first(count: usize) -> Self {
            let store = Self::new();
            store.failures.store(count, Ordering::SeqCst);
            store
        }
    }

    #[async_trait]
    impl DataStore for MemoryStore {
        async fn fetch(&self, path: &SanitizedPath) -> Result<DataFile> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(GatewayError::Io(std::io::Error::other("disk unavailable")));
            }
            self.files
                .get(path.as_str())
                .map(|contents| DataFile {
                    contents: contents.clone(),
                    last_modified: modified_at(),
                })
                .ok_or_else(|| GatewayError::NotFound("dataset not found".to_string()))
        }
    }

    /// Usage log whose reads fail.
    #[derive(Default)]
    struct UnreadableLog {
        inner: InMemoryUsageLog,
    }

    #[async_trait]
    impl UsageLog for UnreadableLog {
        async fn count_in_window(
            &self,
            _user_id: &str,
            _endpoint_key: &str,
            _window_start: DateTime<Utc>,
        ) -> std::result::Result<u64, UsageLogError> {
            Err(UsageLogError::Unavailable("timeout".into()))
        }

        async fn earliest_since(
            &self,
            _user_id: &str,
            _endpoint_key: &str,
            _since: DateTime<Utc>,
        ) -> std::result::Result<Option<DateTime<Utc>>, UsageLogError> {
            Err(UsageLogError::Unavailable("timeout".into()))
        }

        async fn endpoint_keys(
            &self,
            _user_id: &str,
            _since: DateTime<Utc>,
        ) -> std::result::Result<Vec<String>, UsageLogError> {
            Err(UsageLogError::Unavailable("timeout".into()))
        }

        async fn append(
            &self,
            user_id: &str,
            endpoint_key: &str,
            timestamp: DateTime<Utc>,
        ) -> std::result::Result<(), UsageLogError> {
            self.inner.append(user_id, endpoint_key, timestamp).await
        }

        async fn delete_older_than(
            &self,
            cutoff: DateTime<Utc>,
        ) -> std::result::Result<usize, UsageLogError> {
            self.inner.delete_older_than(cutoff).await
        }

        async fn delete_all_for(&self, user_id: &str) -> std::result::Result<usize, UsageLogError> {
            self.inner.delete_all_for(user_id).await
        }
    }

    fn app(usage_log: Arc<dyn UsageLog>, store: MemoryStore) -> Router {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        let state = GatewayState::from_config(&config, usage_log, Arc::new(store)).unwrap();
        build_router(Arc::new(state))
    }

    fn request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn get_as(uri: &str, token: Option<&str>) -> Request<Body> {
        request(Method::GET, uri, token)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());
        let response = app.oneshot(get_as("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_anonymous_public_read() {
        let log = Arc::new(InMemoryUsageLog::new());
        let app = app(log.clone(), MemoryStore::new());

        let response = app
            .oneshot(get_as("/api/v1/data/public/a.json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "5");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "5");
        assert!(response.headers().contains_key(header::ETAG));
        assert!(response.headers().contains_key(header::LAST_MODIFIED));
        assert!(response.headers().contains_key(X_REQUEST_ID));
        assert_eq!(response.headers()[header::CACHE_CONTROL], "private, max-age=300");

        let body = body_json(response).await;
        assert_eq!(body["data"]["k"], 1);
        assert_eq!(body["metadata"]["path"], "public/a.json");
        assert_eq!(body["metadata"]["size"], 7);
        assert_eq!(log.record_count(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_outside_public_prefix_forbidden() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());
        let response = app
            .oneshot(get_as("/api/v1/data/private/p.json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_secure_prefix_needs_tier() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/secure/s.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(get_as("/api/v1/data/secure/s.json", Some("t-bob")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_exceeded() {
        let log = Arc::new(InMemoryUsageLog::new());
        let app = app(log.clone(), MemoryStore::new());

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/problem+json");
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");

        let body = body_json(response).await;
        assert_eq!(body["title"], "Too many requests");
        assert_eq!(body["limit"], 5);
        assert!(body["resetTime"].is_string());
        assert_eq!(log.record_count(), 5, "denied request must not be charged");
    }

    #[tokio::test]
    async fn test_insufficient_tier() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());
        let response = app
            .oneshot(get_as("/api/v1/data/premium/x.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["userTier"], "tier1");
        assert_eq!(body["requiredTier"], "tier3");
    }

    #[tokio::test]
    async fn test_rejected_paths_not_echoed() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/public/..%2fsecretfile.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!body_text(response).await.contains("secretfile"));

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/public/odd%20name.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!body_text(response).await.contains("odd"));

        let response = app
            .oneshot(get_as("/api/v1/data/public/a.txt", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_not_found_and_invalid_dataset() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/public/missing.json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get_as("/api/v1/data/public/broken.json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body_text(response).await.contains("broken"));
    }

    #[tokio::test]
    async fn test_invalid_token_unauthenticated() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());
        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/public/a.json", Some("nope")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let malformed = Request::builder()
            .uri("/api/v1/data/public/a.json")
            .header(header::AUTHORIZATION, "Basic abc")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(malformed).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_conditional_requests_not_charged() {
        let log = Arc::new(InMemoryUsageLog::new());
        let app = app(log.clone(), MemoryStore::new());

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
            .await
            .unwrap();
        let etag = response.headers()[header::ETAG].clone();

        let conditional = Request::builder()
            .uri("/api/v1/data/public/a.json")
            .header(header::AUTHORIZATION, "Bearer t-alice")
            .header(header::IF_NONE_MATCH, etag)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(conditional).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let since = Request::builder()
            .uri("/api/v1/data/public/a.json")
            .header(header::AUTHORIZATION, "Bearer t-alice")
            .header(header::IF_MODIFIED_SINCE, http_date(modified_at()))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(since).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        assert_eq!(log.record_count(), 1);
    }

    #[tokio::test]
    async fn test_warning_header_near_limit() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());

        for i in 1..=4 {
            let response = app
                .clone()
                .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            // 4 of 5 is the first request at 80%.
            assert_eq!(
                response.headers().contains_key(X_RATELIMIT_WARNING),
                i == 4,
                "request {}",
                i
            );
        }
    }

    #[tokio::test]
    async fn test_failed_request_not_charged() {
        let log = Arc::new(InMemoryUsageLog::new());
        let app = app(log.clone(), MemoryStore::failing_first(1));

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body_text(response).await.contains("disk"));

        let response = app
            .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(log.record_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_open_reports_unknown_remaining() {
        let app = app(Arc::new(UnreadableLog::default()), MemoryStore::new());

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "unknown");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "5");
    }

    #[tokio::test]
    async fn test_reload_endpoint_rules() {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        let state = Arc::new(
            GatewayState::from_config(
                &config,
                Arc::new(InMemoryUsageLog::new()),
                Arc::new(MemoryStore::new()),
            )
            .unwrap(),
        );
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/data/premium/x.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        state.reload_endpoints(EndpointRegistry::new());
        let response = app
            .oneshot(get_as("/api/v1/data/premium/x.json", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_usage_status_and_admin_reset() {
        let app = app(Arc::new(InMemoryUsageLog::new()), MemoryStore::new());

        for _ in 0..2 {
            app.clone()
                .oneshot(get_as("/api/v1/data/public/a.json", Some("t-alice")))
                .await
                .unwrap();
        }

        let response = app
            .clone()
            .oneshot(get_as("/api/v1/ratelimit/status", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["userId"], "alice");
        assert_eq!(body["tier"], "tier1");
        assert_eq!(body["currentCount"], 2);
        assert_eq!(body["limit"]["maxRequests"], 5);

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, "/api/v1/admin/ratelimit/alice", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, "/api/v1/admin/ratelimit/alice", Some("t-bob")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, "/api/v1/admin/ratelimit/alice", Some("t-root")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removedRecords"], 2);

        let response = app
            .oneshot(get_as("/api/v1/ratelimit/status", Some("t-alice")))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["currentCount"], 0);
    }
}
