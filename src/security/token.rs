//! Bearer token validation.
//!
//! Token verification is consumed through [`TokenValidator`]. The shipped
//! [`StaticTokenValidator`] resolves opaque tokens from a configured table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use super::context::AuthenticatedUser;
use crate::error::{GatewayError, Result};
use crate::ratelimit::Tier;

/// Errors that can occur while validating a token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed authorization header")]
    Malformed,
    #[error("Unknown token")]
    Unknown,
    #[error("Token expired")]
    Expired,
}

/// Trait for token validator implementations.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Resolve a bearer token to the user it was issued for.
    async fn validate(&self, token: &str) -> std::result::Result<AuthenticatedUser, TokenError>;
}

/// A token entry as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub tier: Tier,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    user: AuthenticatedUser,
    expires_at: Option<DateTime<Utc>>,
}

/// Validator backed by a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, IssuedToken>,
}

impl StaticTokenValidator {
    /// Build a validator from configured entries.
    pub fn from_entries(entries: &[TokenEntry]) -> Result<Self> {
        let mut tokens = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.token.trim().is_empty() || entry.user_id.trim().is_empty() {
                return Err(GatewayError::Config(
                    "token entries need a non-empty token and user_id".to_string(),
                ));
            }
            let issued = IssuedToken {
                user: AuthenticatedUser::new(entry.user_id.clone(), entry.tier),
                expires_at: entry.expires_at,
            };
            if tokens.insert(entry.token.clone(), issued).is_some() {
                return Err(GatewayError::Config(format!(
                    "token for user '{}' is configured more than once",
                    entry.user_id
                )));
            }
        }
        Ok(Self { tokens })
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True if no tokens are configured.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> std::result::Result<AuthenticatedUser, TokenError> {
        let issued = self.tokens.get(token).ok_or(TokenError::Unknown)?;
        if let Some(expires_at) = issued.expires_at {
            if Utc::now() >= expires_at {
                return Err(TokenError::Expired);
            }
        }
        Ok(issued.user.clone())
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> std::result::Result<&str, TokenError> {
    let (scheme, token) = header.trim().split_once(' ').ok_or(TokenError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::Malformed);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Malformed);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(token: &str, user: &str, tier: Tier) -> TokenEntry {
        TokenEntry {
            token: token.to_string(),
            user_id: user.to_string(),
            tier,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_validate_known_token() {
        let validator =
            StaticTokenValidator::from_entries(&[entry("t-1", "alice", Tier::Tier2)]).unwrap();
        let user = validator.validate("t-1").await.unwrap();
        assert_eq!(user, AuthenticatedUser::new("alice", Tier::Tier2));
        assert_eq!(validator.validate("t-2").await.unwrap_err(), TokenError::Unknown);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let mut expired = entry("old", "bob", Tier::Tier1);
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        let validator = StaticTokenValidator::from_entries(&[expired]).unwrap();
        assert_eq!(validator.validate("old").await.unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn test_duplicate_tokens_rejected() {
        let result = StaticTokenValidator::from_entries(&[
            entry("same", "alice", Tier::Tier1),
            entry("same", "bob", Tier::Tier1),
        ]);
        assert!(result.is_err());
        assert!(StaticTokenValidator::from_entries(&[entry("", "alice", Tier::Tier1)]).is_err());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token("bearer   abc ").unwrap(), "abc");
        assert_eq!(bearer_token("Basic abc").unwrap_err(), TokenError::Malformed);
        assert_eq!(bearer_token("Bearer").unwrap_err(), TokenError::Malformed);
        assert_eq!(bearer_token("Bearer  ").unwrap_err(), TokenError::Malformed);
    }
}
