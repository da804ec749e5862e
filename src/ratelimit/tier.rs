//! Service tiers and their rate limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Upper bound for `RateLimit::max_requests`.
pub const MAX_REQUESTS_CAP: u32 = 10_000;
/// Upper bound for `RateLimit::window_seconds` (one day).
pub const MAX_WINDOW_SECONDS: u32 = 86_400;

/// A named service level. Variants are declared in ascending order so the
/// derived `Ord` is the tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

impl Tier {
    /// All tiers, lowest first.
    pub const ALL: [Tier; 3] = [Tier::Tier1, Tier::Tier2, Tier::Tier3];

    /// The lowest tier.
    pub fn lowest() -> Self {
        Tier::Tier1
    }

    /// Name used in configuration and response bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
            Tier::Tier3 => "tier3",
        }
    }

    /// Built-in limit for this tier.
    pub fn default_limit(&self) -> RateLimit {
        match self {
            Tier::Tier1 => RateLimit::new_unchecked(60, 60),
            Tier::Tier2 => RateLimit::new_unchecked(300, 60),
            Tier::Tier3 => RateLimit::new_unchecked(1000, 60),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tier1" | "1" => Ok(Tier::Tier1),
            "tier2" | "2" => Ok(Tier::Tier2),
            "tier3" | "3" => Ok(Tier::Tier3),
            other => Err(GatewayError::Validation(format!("unknown tier '{}'", other))),
        }
    }
}

/// Maximum number of requests allowed within a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    max_requests: u32,
    window_seconds: u32,
}

impl RateLimit {
    /// Create a validated rate limit.
    pub fn new(max_requests: u32, window_seconds: u32) -> Result<Self> {
        if max_requests == 0 || max_requests > MAX_REQUESTS_CAP {
            return Err(GatewayError::Validation(format!(
                "max_requests must be between 1 and {}, got {}",
                MAX_REQUESTS_CAP, max_requests
            )));
        }
        if window_seconds == 0 || window_seconds > MAX_WINDOW_SECONDS {
            return Err(GatewayError::Validation(format!(
                "window_seconds must be between 1 and {}, got {}",
                MAX_WINDOW_SECONDS, window_seconds
            )));
        }
        Ok(Self::new_unchecked(max_requests, window_seconds))
    }

    const fn new_unchecked(max_requests: u32, window_seconds: u32) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    /// Maximum requests per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Window length in seconds.
    pub fn window_seconds(&self) -> u32 {
        self.window_seconds
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds as u64)
    }

    /// Rate normalized to requests per minute.
    pub fn requests_per_minute(&self) -> f64 {
        self.max_requests as f64 / self.window_seconds as f64 * 60.0
    }

    /// True if this limit admits fewer requests per minute than `other`.
    pub fn stricter_than(&self, other: &RateLimit) -> bool {
        self.requests_per_minute() < other.requests_per_minute()
    }

    /// True if this limit admits more requests per minute than `other`.
    pub fn looser_than(&self, other: &RateLimit) -> bool {
        self.requests_per_minute() > other.requests_per_minute()
    }
}

/// Mapping from tier to its rate limit.
///
/// Construction guarantees that a higher tier is never stricter than a lower one.
#[derive(Debug, Clone, PartialEq)]
pub struct TierCatalog {
    limits: BTreeMap<Tier, RateLimit>,
}

impl TierCatalog {
    /// Build a catalog from the built-in limits with the given overrides applied.
    pub fn with_overrides<I>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Tier, RateLimit)>,
    {
        let mut limits: BTreeMap<Tier, RateLimit> = Tier::ALL
            .iter()
            .map(|tier| (*tier, tier.default_limit()))
            .collect();
        limits.extend(overrides);

        let ordered: Vec<(&Tier, &RateLimit)> = limits.iter().collect();
        for pair in ordered.windows(2) {
            let (lower_tier, lower) = pair[0];
            let (higher_tier, higher) = pair[1];
            if higher.stricter_than(lower) {
                return Err(GatewayError::Config(format!(
                    "tier {} ({:.2} req/min) is stricter than tier {} ({:.2} req/min)",
                    higher_tier,
                    higher.requests_per_minute(),
                    lower_tier,
                    lower.requests_per_minute()
                )));
            }
        }

        Ok(Self { limits })
    }

    /// Look up the limit for a tier.
    pub fn default_limit_for(&self, tier: Tier) -> RateLimit {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_limit())
    }

    /// The longest window of any tier.
    pub fn longest_window(&self) -> std::time::Duration {
        self.limits
            .values()
            .map(RateLimit::window)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Iterate over all tiers and their limits, lowest tier first.
    pub fn iter(&self) -> impl Iterator<Item = (Tier, RateLimit)> + '_ {
        self.limits.iter().map(|(tier, limit)| (*tier, *limit))
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self {
            limits: Tier::ALL
                .iter()
                .map(|tier| (*tier, tier.default_limit()))
                .collect(),
        }
    }
}
