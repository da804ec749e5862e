//! Access control decision combining tier requirements and usage.

use chrono::{DateTime, Utc};
use tracing::trace;

use super::endpoint::EndpointDescriptor;
use super::tier::{RateLimit, TierCatalog};
use super::window::RateLimitWindow;
use crate::error::{GatewayError, Result};
use crate::security::AuthenticatedUser;

/// Outcome of a rate check for a user that passed the tier check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests already counted in the window
    pub current_count: u64,
    /// Limit applied
    pub limit: RateLimit,
    /// `max(0, limit - current_count)`
    pub remaining: u32,
    /// When the allowance resets
    pub reset_time: DateTime<Utc>,
}

/// Decide whether `user` may call `endpoint` given `current_count` requests
/// already counted in `window`.
///
/// The tier requirement is checked first and fails closed. The rate check
/// admits a request only while `current_count < max_requests`, so the
/// request arriving when the count equals the limit is rejected.
pub fn decide(
    user: &AuthenticatedUser,
    endpoint: &EndpointDescriptor,
    current_count: u64,
    window: &RateLimitWindow,
    catalog: &TierCatalog,
    now: DateTime<Utc>,
) -> Result<Decision> {
    check_tier(user, endpoint)?;

    let limit = catalog.default_limit_for(user.tier);
    let max = limit.max_requests() as u64;
    let allowed = current_count < max;
    let remaining = max.saturating_sub(current_count) as u32;
    let reset_time = window.reset_time(now);

    trace!(
        user_id = %user.user_id,
        endpoint = %endpoint.key(),
        current_count,
        limit = limit.max_requests(),
        allowed,
        "Rate decision"
    );

    Ok(Decision {
        allowed,
        current_count,
        limit,
        remaining,
        reset_time,
    })
}

/// Fail with `InsufficientTier` if the user's tier is below the endpoint's.
pub fn check_tier(user: &AuthenticatedUser, endpoint: &EndpointDescriptor) -> Result<()> {
    if user.tier < endpoint.required_tier {
        return Err(GatewayError::InsufficientTier {
            user_tier: user.tier,
            required_tier: endpoint.required_tier,
        });
    }
    Ok(())
}
