//! Tiered rate limiting: tiers, windows, decisions and usage accounting.

mod decision;
mod endpoint;
mod rules;
mod service;
mod tier;
mod usage;
mod window;

pub use decision::{check_tier, decide, Decision};
pub use endpoint::EndpointDescriptor;
pub use rules::{EndpointRegistry, EndpointRule};
pub use service::{EndpointUsage, RateLimitService, RateLimitStatus, Remaining, UsageStatus};
pub use tier::{RateLimit, Tier, TierCatalog, MAX_REQUESTS_CAP, MAX_WINDOW_SECONDS};
pub use usage::{InMemoryUsageLog, UsageLog, UsageLogError, UsageRecord};
pub use window::RateLimitWindow;
