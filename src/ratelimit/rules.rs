//! Endpoint rules configuration and matching.
//!
//! This module builds the endpoint table (method, path pattern, required tier)
//! from configured rules and resolves an incoming request to the most specific matching descriptor.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::endpoint::EndpointDescriptor;
use super::tier::Tier;
use crate::error::{GatewayError, Result};

/// One endpoint rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Path pattern; `*` matches one segment
    pub path: String,
    /// Minimum tier required
    #[serde(default = "Tier::lowest")]
    pub required_tier: Tier,
}

fn default_method() -> String {
    "GET".to_string()
}

/// The set of registered endpoint descriptors.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<EndpointDescriptor>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured rules.
    pub fn from_rules(rules: &[EndpointRule]) -> Result<Self> {
        let mut registry = Self::new();
        for rule in rules {
            registry.register(EndpointDescriptor::new(
                &rule.method,
                &rule.path,
                rule.required_tier,
            )?)?;
        }
        Ok(registry)
    }

    /// Register a descriptor. Registering the same method and pattern twice
    /// is a configuration error.
    pub fn register(&mut self, descriptor: EndpointDescriptor) -> Result<()> {
        if self
            .endpoints
            .iter()
            .any(|existing| existing.key() == descriptor.key())
        {
            return Err(GatewayError::Config(format!(
                "duplicate endpoint rule '{}'",
                descriptor.key()
            )));
        }
        debug!(endpoint = %descriptor, "Registered endpoint");
        self.endpoints.push(descriptor);
        Ok(())
    }

    /// Find the most specific descriptor matching the request. On ties the
    /// first registered descriptor wins.
    pub fn find(&self, method: &str, path: &str) -> Option<&EndpointDescriptor> {
        let mut best: Option<&EndpointDescriptor> = None;
        for descriptor in self.endpoints.iter().filter(|d| d.matches(method, path)) {
            match best {
                Some(current) if current.specificity() >= descriptor.specificity() => {}
                _ => best = Some(descriptor),
            }
        }
        best
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// True if no descriptors are registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
