//! Endpoint descriptors and pattern matching.

use serde::{Deserialize, Serialize};

use super::tier::Tier;
use crate::error::{GatewayError, Result};

/// Wildcard segment matching exactly one path segment.
pub const WILDCARD: &str = "*";

/// A registered route with the minimum tier needed to call it.
///
/// The descriptor key (`"METHOD /pattern"`) identifies the endpoint in the
/// usage log, so every request matching the same descriptor shares a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// HTTP method, upper-case
    pub method: String,
    /// Normalized path pattern, always starting with `/`
    pub pattern: String,
    /// Minimum tier allowed to call this endpoint
    pub required_tier: Tier,
}

impl EndpointDescriptor {
    /// Create a descriptor, normalizing the method and pattern.
    pub fn new(method: &str, pattern: &str, required_tier: Tier) -> Result<Self> {
        let method = method.trim().to_ascii_uppercase();
        if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(GatewayError::Config(format!("invalid HTTP method '{}'", method)));
        }

        let pattern = pattern.trim();
        if !pattern.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "endpoint pattern '{}' must start with '/'",
                pattern
            )));
        }

        let segments = split_segments(pattern);
        if segments
            .iter()
            .any(|s| s.contains('*') && *s != WILDCARD)
        {
            return Err(GatewayError::Config(format!(
                "endpoint pattern '{}' may only use '*' as a whole segment",
                pattern
            )));
        }

        Ok(Self {
            method,
            pattern: format!("/{}", segments.join("/")),
            required_tier,
        })
    }

    /// Key used for usage accounting.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.pattern)
    }

    /// True if the method and path both match.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && self.matches_path(path)
    }

    /// Segment-wise match. `*` matches exactly one segment and the segment
    /// counts must be equal.
    pub fn matches_path(&self, path: &str) -> bool {
        let pattern = split_segments(&self.pattern);
        let actual = split_segments(path);

        pattern.len() == actual.len()
            && pattern
                .iter()
                .zip(actual.iter())
                .all(|(expected, got)| *expected == WILDCARD || expected == got)
    }

    /// Number of literal (non-wildcard) segments, used to prefer the most
    /// specific descriptor when several match.
    pub fn specificity(&self) -> usize {
        split_segments(&self.pattern)
            .iter()
            .filter(|s| **s != WILDCARD)
            .count()
    }
}

impl std::fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (requires {})", self.key(), self.required_tier)
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
