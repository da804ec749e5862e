//! Configuration management for Datagate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::ratelimit::{EndpointRegistry, EndpointRule, RateLimit, Tier, TierCatalog};
use crate::security::{AccessPolicy, StaticTokenValidator, TokenEntry};

/// Prefix for environment variable overrides, e.g. `DATAGATE__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "DATAGATE";

/// Main configuration for the Datagate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Authentication and path security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Dataset storage configuration
    #[serde(default)]
    pub data: DataConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Limit override for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimitConfig {
    pub tier: Tier,
    pub max_requests: u32,
    pub window_seconds: u32,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Per-tier limit overrides
    #[serde(default)]
    pub tiers: Vec<TierLimitConfig>,

    /// Endpoint rules with required tiers
    #[serde(default)]
    pub endpoints: Vec<EndpointRule>,

    /// Interval of the usage retention sweep in seconds, at least 1
    #[serde(default = "default_sweep_interval")]
    pub retention_sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            endpoints: Vec::new(),
            retention_sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Authentication and path security configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Servable file extensions
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Prefix whose datasets need `secure_min_tier`
    #[serde(default = "default_secure_prefix")]
    pub secure_prefix: String,

    /// Minimum tier for the secure prefix
    #[serde(default = "default_secure_min_tier")]
    pub secure_min_tier: Tier,

    /// Prefixes readable without credentials
    #[serde(default = "default_public_prefixes")]
    pub public_prefixes: Vec<String>,

    /// Issued bearer tokens
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,

    /// Users allowed to call administrative endpoints
    #[serde(default)]
    pub admin_users: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            secure_prefix: default_secure_prefix(),
            secure_min_tier: default_secure_min_tier(),
            public_prefixes: default_public_prefixes(),
            tokens: Vec::new(),
            admin_users: Vec::new(),
        }
    }
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["json".to_string()]
}

fn default_secure_prefix() -> String {
    "secure/".to_string()
}

fn default_secure_min_tier() -> Tier {
    Tier::Tier2
}

fn default_public_prefixes() -> Vec<String> {
    vec!["public/".to_string()]
}

/// Dataset storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the datasets
    #[serde(default = "default_data_root")]
    pub root: PathBuf,

    /// `Cache-Control: max-age` for dataset responses
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age_secs: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_root(),
            cache_max_age_secs: default_cache_max_age(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_cache_max_age() -> u64 {
    300
}

impl GatewayConfig {
    /// Load configuration from an optional file layered under
    /// `DATAGATE__*` environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: GatewayConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.tier_catalog()?;
        self.endpoint_registry()?;
        self.token_validator()?;

        if self.rate_limiting.retention_sweep_interval_secs == 0 {
            return Err(GatewayError::Config(
                "rate_limiting.retention_sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.security.allowed_extensions.is_empty() {
            return Err(GatewayError::Config(
                "security.allowed_extensions must not be empty".to_string(),
            ));
        }
        if self
            .security
            .allowed_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').is_empty())
        {
            return Err(GatewayError::Config(
                "security.allowed_extensions contains an empty entry".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the tier catalog, applying overrides.
    pub fn tier_catalog(&self) -> Result<TierCatalog> {
        let mut overrides = Vec::with_capacity(self.rate_limiting.tiers.len());
        for entry in &self.rate_limiting.tiers {
            let limit = RateLimit::new(entry.max_requests, entry.window_seconds).map_err(|e| {
                GatewayError::Config(format!("invalid limit for {}: {}", entry.tier, e))
            })?;
            overrides.push((entry.tier, limit));
        }
        TierCatalog::with_overrides(overrides)
    }

    /// Build the endpoint registry.
    pub fn endpoint_registry(&self) -> Result<EndpointRegistry> {
        EndpointRegistry::from_rules(&self.rate_limiting.endpoints)
    }

    /// Build the path access policy.
    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            allowed_extensions: self.security.allowed_extensions.clone(),
            secure_prefix: self.security.secure_prefix.clone(),
            secure_min_tier: self.security.secure_min_tier,
            public_prefixes: self.security.public_prefixes.clone(),
        }
    }

    /// Build the token validator.
    pub fn token_validator(&self) -> Result<StaticTokenValidator> {
        StaticTokenValidator::from_entries(&self.security.tokens)
    }

    /// Interval of the retention sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limiting.retention_sweep_interval_secs)
    }
}
