//! Rate limit service: window tracking, decisions and usage accounting.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::decision::{check_tier, decide};
use super::endpoint::EndpointDescriptor;
use super::tier::{RateLimit, TierCatalog};
use super::usage::{UsageLog, UsageLogError};
use super::window::RateLimitWindow;
use crate::error::{GatewayError, Result};
use crate::security::AuthenticatedUser;

/// Usage share (in percent, including the current request) at which
/// clients get a warning header.
pub const WARNING_THRESHOLD_PERCENT: u64 = 80;

/// Remaining allowance, unknown when the usage log could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Known(u32),
    Unknown,
}

impl std::fmt::Display for Remaining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remaining::Known(n) => write!(f, "{}", n),
            Remaining::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for Remaining {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Remaining::Known(n) => serializer.serialize_u32(*n),
            Remaining::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// Result of a limit check, computed fresh per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub current_count: u64,
    pub limit: RateLimit,
    pub remaining: Remaining,
    pub reset_time: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
}

impl RateLimitStatus {
    fn fail_open(limit: RateLimit, window: &RateLimitWindow, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            current_count: 0,
            limit,
            remaining: Remaining::Unknown,
            reset_time: window.reset_time(now),
            window_start: window.start_time(),
        }
    }

    /// True if the status was produced without reading the usage log.
    pub fn is_fail_open(&self) -> bool {
        self.remaining == Remaining::Unknown
    }

    /// Whole seconds until the reset, at least one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_time - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }

    /// True once usage, counting the current request, reaches the warning
    /// threshold of an allowed request.
    pub fn crossed_warning_threshold(&self) -> bool {
        if !self.allowed || self.is_fail_open() {
            return false;
        }
        let used = self.current_count + 1;
        used * 100 >= self.limit.max_requests() as u64 * WARNING_THRESHOLD_PERCENT
    }
}

/// Usage of one endpoint within its active window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointUsage {
    pub endpoint: String,
    pub current_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Read-only snapshot of a user's usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub current_count: u64,
    pub limit: RateLimit,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub endpoints: Vec<EndpointUsage>,
}

/// (user id, endpoint key)
type WindowKey = (String, String);

/// The rate limit service.
///
/// Window anchors and counts both come from the usage log, so services
/// sharing a log agree on every verdict. Anchors seen by this instance are
/// cached per user and endpoint. The service is thread-safe and can be
/// shared across tasks.
pub struct RateLimitService {
    usage_log: Arc<dyn UsageLog>,
    catalog: TierCatalog,
    /// Cached start of the active window per user and endpoint
    windows: DashMap<WindowKey, DateTime<Utc>>,
}

impl RateLimitService {
    /// Create a service over the given usage log and tier catalog.
    pub fn new(usage_log: Arc<dyn UsageLog>, catalog: TierCatalog) -> Self {
        Self {
            usage_log,
            catalog,
            windows: DashMap::new(),
        }
    }

    /// The tier catalog in use.
    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// Check the limit for a request happening now. Does not mutate state.
    pub async fn check_limit(
        &self,
        user: &AuthenticatedUser,
        endpoint: &EndpointDescriptor,
    ) -> Result<RateLimitStatus> {
        self.check_limit_at(user, endpoint, Utc::now()).await
    }

    /// Check the limit as of `now`.
    ///
    /// A tier mismatch is reported as an error. If the usage log fails the
    /// request is allowed with an unknown remaining allowance.
    pub async fn check_limit_at(
        &self,
        user: &AuthenticatedUser,
        endpoint: &EndpointDescriptor,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus> {
        check_tier(user, endpoint)?;

        let limit = self.catalog.default_limit_for(user.tier);
        let endpoint_key = endpoint.key();

        let active = match self.active_window(&user.user_id, &endpoint_key, &limit, now).await {
            Ok(active) => active,
            Err(e) => {
                warn!(
                    user_id = %user.user_id,
                    endpoint = %endpoint_key,
                    error = %e,
                    "Usage log unavailable, failing open"
                );
                let window = RateLimitWindow::starting_at(now, &limit);
                return Ok(RateLimitStatus::fail_open(limit, &window, now));
            }
        };

        let (window, current_count) = match active {
            None => (RateLimitWindow::starting_at(now, &limit), 0),
            Some(window) => {
                match self
                    .usage_log
                    .count_in_window(&user.user_id, &endpoint_key, window.start_time())
                    .await
                {
                    Ok(count) => (window, count),
                    Err(e) => {
                        warn!(
                            user_id = %user.user_id,
                            endpoint = %endpoint_key,
                            error = %e,
                            "Usage log unavailable, failing open"
                        );
                        return Ok(RateLimitStatus::fail_open(limit, &window, now));
                    }
                }
            }
        };

        let decision = decide(user, endpoint, current_count, &window, &self.catalog, now)?;

        if !decision.allowed {
            debug!(
                user_id = %user.user_id,
                endpoint = %endpoint_key,
                count = current_count,
                limit = limit.max_requests(),
                "Rate limit exceeded"
            );
        }

        Ok(RateLimitStatus {
            allowed: decision.allowed,
            current_count: decision.current_count,
            limit: decision.limit,
            remaining: Remaining::Known(decision.remaining),
            reset_time: decision.reset_time,
            window_start: window.start_time(),
        })
    }

    /// Charge one request to the user. Call only after a successful response.
    pub async fn record_usage(
        &self,
        user: &AuthenticatedUser,
        endpoint: &EndpointDescriptor,
    ) -> Result<()> {
        self.record_usage_at(user, endpoint, Utc::now()).await
    }

    /// Charge one request at `now`, opening a new window if none is active.
    pub async fn record_usage_at(
        &self,
        user: &AuthenticatedUser,
        endpoint: &EndpointDescriptor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let limit = self.catalog.default_limit_for(user.tier);
        let endpoint_key = endpoint.key();

        let active = self
            .active_window(&user.user_id, &endpoint_key, &limit, now)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    user_id = %user.user_id,
                    endpoint = %endpoint_key,
                    error = %e,
                    "Could not read window start, anchoring at now"
                );
                None
            });
        if active.is_none() {
            self.windows
                .insert((user.user_id.clone(), endpoint_key.clone()), now);
        }

        self.usage_log
            .append(&user.user_id, &endpoint_key, now)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to record usage: {}", e)))
    }

    /// Snapshot of the user's usage across all active windows.
    pub async fn get_usage_status(&self, user: &AuthenticatedUser) -> Result<UsageStatus> {
        self.get_usage_status_at(user, Utc::now()).await
    }

    /// Snapshot as of `now`.
    pub async fn get_usage_status_at(
        &self,
        user: &AuthenticatedUser,
        now: DateTime<Utc>,
    ) -> Result<UsageStatus> {
        let limit = self.catalog.default_limit_for(user.tier);
        let read_error = |e: UsageLogError| GatewayError::Internal(format!("failed to read usage: {}", e));

        let since = now - Duration::seconds(limit.window_seconds() as i64);
        let keys = self
            .usage_log
            .endpoint_keys(&user.user_id, since)
            .await
            .map_err(read_error)?;

        let mut endpoints = Vec::with_capacity(keys.len());
        for endpoint_key in keys {
            let Some(window) = self
                .active_window(&user.user_id, &endpoint_key, &limit, now)
                .await
                .map_err(read_error)?
            else {
                continue;
            };
            let current_count = self
                .usage_log
                .count_in_window(&user.user_id, &endpoint_key, window.start_time())
                .await
                .map_err(read_error)?;
            endpoints.push(EndpointUsage {
                endpoint: endpoint_key,
                current_count,
                window_start: window.start_time(),
                window_end: window.end_time(),
            });
        }

        let fresh = RateLimitWindow::starting_at(now, &limit);
        let window_start = endpoints
            .iter()
            .map(|e| e.window_start)
            .min()
            .unwrap_or(fresh.start_time());
        let window_end = endpoints
            .iter()
            .map(|e| e.window_end)
            .max()
            .unwrap_or(fresh.end_time());

        Ok(UsageStatus {
            current_count: endpoints.iter().map(|e| e.current_count).sum(),
            limit,
            window_start,
            window_end,
            endpoints,
        })
    }

    /// Clear all usage of a user. Returns the number of removed records.
    pub async fn reset_limit(&self, user_id: &str) -> Result<usize> {
        let removed = self
            .usage_log
            .delete_all_for(user_id)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to reset usage: {}", e)))?;
        self.windows.retain(|key, _| key.0 != user_id);

        info!(user_id = %user_id, removed, "Rate limit reset");
        Ok(removed)
    }

    /// Drop expired window anchors and usage records older than the longest
    /// tier window. Returns the number of removed records.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let longest = self.catalog.longest_window();
        let cutoff = now - Duration::seconds(longest.as_secs() as i64);

        self.windows.retain(|_, start| *start > cutoff);

        self.usage_log
            .delete_older_than(cutoff)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to prune usage: {}", e)))
    }

    /// Number of cached window anchors.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// The window active at `now`, if any.
    ///
    /// A current cached anchor is used as is. Otherwise the anchor is the
    /// oldest record within the last window length, skipping records that
    /// belong to an expired cached window. Expired anchors are evicted here.
    async fn active_window(
        &self,
        user_id: &str,
        endpoint_key: &str,
        limit: &RateLimit,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<RateLimitWindow>, UsageLogError> {
        let key = (user_id.to_string(), endpoint_key.to_string());
        let mut since = now - Duration::seconds(limit.window_seconds() as i64);

        let cached = self.windows.get(&key).map(|start| *start);
        if let Some(start) = cached {
            let window = RateLimitWindow::new(start, limit.window_seconds());
            if window.is_current(now) {
                return Ok(Some(window));
            }
            since = since.max(window.end_time());
            self.windows.remove(&key);
        }

        let Some(start) = self.usage_log.earliest_since(user_id, endpoint_key, since).await? else {
            return Ok(None);
        };
        let window = RateLimitWindow::new(start, limit.window_seconds());
        if !window.is_current(now) {
            return Ok(None);
        }
        self.windows.insert(key, start);
        Ok(Some(window))
    }
}
