//! HTTP rendering: problem bodies, rate limit headers and cache validators.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::error::{ErrorClass, GatewayError};
use crate::ratelimit::{RateLimitStatus, Tier};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_WARNING: HeaderName = HeaderName::from_static("x-ratelimit-warning");

const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// RFC 7807 style problem body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_tier: Option<Tier>,
}

impl ProblemDetails {
    /// Build the problem body for an error. Details never contain raw
    /// request input or internal fault descriptions.
    pub fn from_error(error: &GatewayError, instance: &str) -> Self {
        let status = status_for(error.class());
        let (problem_type, title, detail) = match error {
            GatewayError::Validation(msg) => ("validation-error", "Invalid request", msg.clone()),
            GatewayError::Unauthenticated(msg) => ("unauthorized", "Authentication required", msg.clone()),
            GatewayError::InsufficientTier { .. } => (
                "insufficient-tier",
                "Insufficient tier",
                "Your tier does not grant access to this endpoint".to_string(),
            ),
            GatewayError::Forbidden(msg) => ("forbidden", "Access denied", msg.clone()),
            GatewayError::Security(_) => (
                "security-violation",
                "Request rejected",
                "The requested path is not permitted".to_string(),
            ),
            GatewayError::RateLimited { limit, .. } => (
                "rate-limit-exceeded",
                "Too many requests",
                format!("Rate limit of {} requests exceeded", limit),
            ),
            GatewayError::NotFound(msg) => ("not-found", "Not found", msg.clone()),
            GatewayError::Internal(_) | GatewayError::Config(_) | GatewayError::Io(_) => (
                "internal-error",
                "Internal server error",
                "An unexpected error occurred".to_string(),
            ),
        };

        let mut problem = Self {
            problem_type: problem_type.to_string(),
            title: title.to_string(),
            status: status.as_u16(),
            detail,
            instance: instance.to_string(),
            limit: None,
            reset_time: None,
            user_tier: None,
            required_tier: None,
        };

        match error {
            GatewayError::RateLimited {
                limit, reset_time, ..
            } => {
                problem.limit = Some(*limit);
                problem.reset_time = Some(*reset_time);
            }
            GatewayError::InsufficientTier {
                user_tier,
                required_tier,
            } => {
                problem.user_tier = Some(*user_tier);
                problem.required_tier = Some(*required_tier);
            }
            _ => {}
        }
        problem
    }
}

/// HTTP status for an error class.
pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorClass::Forbidden | ErrorClass::Security => StatusCode::FORBIDDEN,
        ErrorClass::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// An error on its way to the client.
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub request_id: String,
    pub rate_status: Option<RateLimitStatus>,
}

impl ApiError {
    /// Wrap an error for a request.
    pub fn new(error: GatewayError, request_id: &str) -> Self {
        Self {
            error,
            request_id: request_id.to_string(),
            rate_status: None,
        }
    }

    /// Attach the rate limit status so its headers are sent.
    pub fn with_rate_status(mut self, status: RateLimitStatus) -> Self {
        self.rate_status = Some(status);
        self
    }

    /// A 429 for a denied status.
    pub fn rate_limited(status: RateLimitStatus, request_id: &str, now: DateTime<Utc>) -> Self {
        Self::new(
            GatewayError::RateLimited {
                limit: status.limit.max_requests(),
                reset_time: status.reset_time,
                retry_after_secs: status.retry_after_secs(now),
            },
            request_id,
        )
        .with_rate_status(status)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.error.class();
        match class {
            ErrorClass::Internal => {
                error!(request_id = %self.request_id, error = %self.error, "Request failed")
            }
            ErrorClass::Security | ErrorClass::RateLimit => {
                warn!(request_id = %self.request_id, class = %class, "Request rejected")
            }
            _ => debug!(request_id = %self.request_id, error = %self.error, "Request rejected"),
        }

        let instance = format!("urn:uuid:{}", self.request_id);
        let problem = ProblemDetails::from_error(&self.error, &instance);
        let mut response = (status_for(class), Json(problem)).into_response();

        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        if let Some(status) = &self.rate_status {
            apply_rate_limit_headers(headers, status);
        }
        if let GatewayError::RateLimited {
            retry_after_secs, ..
        } = &self.error
        {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        response
    }
}

/// Set the `X-RateLimit-*` headers for a status.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit.max_requests()));
    if let Ok(value) = HeaderValue::from_str(&status.remaining.to_string()) {
        headers.insert(X_RATELIMIT_REMAINING, value);
    }
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(status.reset_time.timestamp()));

    if status.crossed_warning_threshold() {
        let message = format!(
            "{} of {} requests used in the current window",
            status.current_count + 1,
            status.limit.max_requests()
        );
        if let Ok(value) = HeaderValue::from_str(&message) {
            headers.insert(X_RATELIMIT_WARNING, value);
        }
    }
}

/// Strong entity tag: quoted SHA-256 of the content.
pub fn content_etag(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// IMF-fixdate rendering used by `Last-Modified`.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date header value.
///
/// Only the IMF-fixdate form (and other RFC 2822 dates) is accepted. The
/// obsolete RFC 850 and asctime forms yield `None`, so an `If-Modified-Since`
/// written that way is ignored and the full response is sent.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Evaluate conditional request headers. `If-None-Match` takes precedence
/// over `If-Modified-Since`.
pub fn is_not_modified(headers: &HeaderMap, etag: &str, last_modified: DateTime<Utc>) -> bool {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        return value
            .split(',')
            .map(|candidate| candidate.trim().trim_start_matches("W/"))
            .any(|candidate| candidate == "*" || candidate == etag);
    }

    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .map(|since| last_modified.timestamp() <= since.timestamp())
        .unwrap_or(false)
}
