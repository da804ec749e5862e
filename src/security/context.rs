//! Per-request identity.

use serde::Serialize;

use crate::ratelimit::Tier;

/// User id under which anonymous traffic is accounted.
pub const ANONYMOUS_USER_ID: &str = "anonymous";

/// A caller whose token was validated. Built once per request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub tier: Tier,
}

impl AuthenticatedUser {
    /// Create a new authenticated user.
    pub fn new(user_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
        }
    }
}

/// Identity and correlation data for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    user: Option<AuthenticatedUser>,
    request_id: String,
}

impl SecurityContext {
    /// Context for a request without credentials.
    pub fn anonymous(request_id: impl Into<String>) -> Self {
        Self {
            user: None,
            request_id: request_id.into(),
        }
    }

    /// Context for an authenticated request.
    pub fn authenticated(user: AuthenticatedUser, request_id: impl Into<String>) -> Self {
        Self {
            user: Some(user),
            request_id: request_id.into(),
        }
    }

    /// The authenticated user, if any.
    pub fn user(&self) -> Option<&AuthenticatedUser> {
        self.user.as_ref()
    }

    /// Request correlation id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// True when no credentials were presented.
    pub fn is_anonymous(&self) -> bool {
        self.user.is_none()
    }

    /// The identity charged for this request: the user, or a shared
    /// anonymous identity at the lowest tier.
    pub fn rate_limit_subject(&self) -> AuthenticatedUser {
        self.user
            .clone()
            .unwrap_or_else(|| AuthenticatedUser::new(ANONYMOUS_USER_ID, Tier::lowest()))
    }
}
