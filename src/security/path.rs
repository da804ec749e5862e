//! Secure data path resolution.
//!
//! Raw paths from requests are turned into [`SanitizedPath`] values here and
//! nowhere else. A sanitized path is relative, free of traversal sequences,
//! limited to `[A-Za-z0-9_\-./]` and carries a whitelisted extension, so it
//! can be used directly as a storage key.

use tracing::{debug, warn};

use super::context::SecurityContext;
use crate::error::{GatewayError, Result, SecurityViolation};
use crate::ratelimit::Tier;

/// Longest accepted raw path, in characters.
pub const MAX_PATH_LENGTH: usize = 254;

const ROOT: &str = "/";

/// Encoded sequences rejected as traversal attempts, matched case-insensitively.
const ENCODED_PATTERNS: &[(&str, &str)] = &[
    ("%00", "encoded null byte"),
    ("%2e%2e", "encoded dot-dot"),
    ("%2e.", "encoded dot-dot"),
    (".%2e", "encoded dot-dot"),
    ("..%2f", "encoded separator traversal"),
    ("..%5c", "encoded backslash traversal"),
    ("%252e", "double-encoded dot"),
    ("%5c", "encoded backslash"),
];

/// A validated, canonical, relative dataset path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SanitizedPath(String);

impl SanitizedPath {
    /// The canonical path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Extension of the final segment, without the dot.
    pub fn extension(&self) -> Option<&str> {
        extension_of(&self.0)
    }

    /// True if the path is under `prefix` (a `/`-terminated relative prefix).
    pub fn is_under(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl std::fmt::Display for SanitizedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SanitizedPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Outcome of an authorization check on a valid path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied { reason: String },
}

impl AccessDecision {
    /// True if access is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }

    /// Convert a denial into a `Forbidden` error.
    pub fn into_result(self) -> Result<()> {
        match self {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied { reason } => Err(GatewayError::Forbidden(reason)),
        }
    }
}

/// Rules applied by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPolicy {
    /// Extensions that may be served, without the dot
    pub allowed_extensions: Vec<String>,
    /// Prefix whose datasets need an elevated tier
    pub secure_prefix: String,
    /// Minimum tier for the secure prefix
    pub secure_min_tier: Tier,
    /// Prefixes readable without credentials
    pub public_prefixes: Vec<String>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["json".to_string()],
            secure_prefix: "secure/".to_string(),
            secure_min_tier: Tier::Tier2,
            public_prefixes: vec!["public/".to_string()],
        }
    }
}

/// Validates raw request paths and authorizes access to them.
#[derive(Debug, Clone, Default)]
pub struct SecurePathResolver {
    policy: AccessPolicy,
}

impl SecurePathResolver {
    /// Create a resolver for the given policy. Prefixes are normalized to
    /// relative, `/`-terminated form.
    pub fn new(policy: AccessPolicy) -> Self {
        Self {
            policy: AccessPolicy {
                allowed_extensions: policy
                    .allowed_extensions
                    .iter()
                    .map(|e| e.trim_start_matches('.').to_string())
                    .collect(),
                secure_prefix: normalize_prefix(&policy.secure_prefix),
                secure_min_tier: policy.secure_min_tier,
                public_prefixes: policy
                    .public_prefixes
                    .iter()
                    .map(|p| normalize_prefix(p))
                    .collect(),
            },
        }
    }

    /// The policy in use.
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Validate a raw path and return its canonical form.
    ///
    /// Security-classed rejections are logged with the matched pattern and
    /// the request id only; the raw value is never logged or returned.
    pub fn validate_and_sanitize(&self, raw: &str, ctx: &SecurityContext) -> Result<SanitizedPath> {
        if raw.is_empty() || raw.chars().count() > MAX_PATH_LENGTH {
            return Err(GatewayError::Validation(format!(
                "path must be between 1 and {} characters",
                MAX_PATH_LENGTH
            )));
        }

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Validation("path must not be blank".to_string()));
        }

        let normalized = normalize(trimmed);

        if let Some(pattern) = find_traversal_pattern(&normalized) {
            warn!(
                request_id = %ctx.request_id(),
                pattern,
                "Rejected path traversal attempt"
            );
            return Err(GatewayError::Security(SecurityViolation::PathTraversal { pattern }));
        }

        if !normalized.chars().all(is_allowed_char) {
            return Err(GatewayError::Validation(
                "path contains characters outside [A-Za-z0-9_-./]".to_string(),
            ));
        }

        if normalized != ROOT && normalized.split('/').any(|s| s == ".") {
            return Err(GatewayError::Validation(
                "path must not contain '.' segments".to_string(),
            ));
        }

        let extension_allowed = extension_of(&normalized)
            .map(|ext| self.policy.allowed_extensions.iter().any(|a| a == ext))
            .unwrap_or(false);
        if !extension_allowed {
            warn!(
                request_id = %ctx.request_id(),
                "Rejected path with disallowed extension"
            );
            return Err(GatewayError::Security(SecurityViolation::DisallowedExtension));
        }

        debug!(request_id = %ctx.request_id(), path = %normalized, "Path sanitized");
        Ok(SanitizedPath(normalized))
    }

    /// Authorize access to a sanitized path.
    pub fn check_access(&self, path: &SanitizedPath, ctx: &SecurityContext) -> AccessDecision {
        if path.is_under(&self.policy.secure_prefix) {
            return match ctx.user() {
                None => AccessDecision::Denied {
                    reason: "authentication required for secure datasets".to_string(),
                },
                Some(user) if user.tier < self.policy.secure_min_tier => AccessDecision::Denied {
                    reason: format!(
                        "secure datasets require {} or above",
                        self.policy.secure_min_tier
                    ),
                },
                Some(_) => AccessDecision::Allowed,
            };
        }

        if ctx.is_anonymous()
            && !self
                .policy
                .public_prefixes
                .iter()
                .any(|prefix| path.is_under(prefix))
        {
            return AccessDecision::Denied {
                reason: "authentication required for this dataset".to_string(),
            };
        }

        AccessDecision::Allowed
    }
}

/// Trim is done by the caller. Collapses repeated separators and strips
/// one leading separator; a sole root stays as-is.
fn normalize(path: &str) -> String {
    let mut collapsed = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        collapsed.push(c);
    }

    if collapsed == ROOT {
        return collapsed;
    }
    match collapsed.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => collapsed,
    }
}

fn find_traversal_pattern(path: &str) -> Option<&'static str> {
    if path.contains('\0') {
        return Some("null byte");
    }
    if path.contains('\\') {
        return Some("backslash");
    }

    let lowered = path.to_ascii_lowercase();
    if let Some((_, name)) = ENCODED_PATTERNS
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
    {
        return Some(name);
    }

    if path.split('/').any(|segment| segment == "..") {
        return Some("dot-dot segment");
    }
    None
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

fn extension_of(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::security::AuthenticatedUser;

    fn ctx() -> SecurityContext {
        SecurityContext::anonymous("test")
    }

    fn user_ctx(tier: Tier) -> SecurityContext {
        SecurityContext::authenticated(AuthenticatedUser::new("u1", tier), "test")
    }

    fn resolver() -> SecurePathResolver {
        SecurePathResolver::new(AccessPolicy::default())
    }

    #[test]
    fn test_valid_path_is_returned_verbatim() {
        let path = resolver()
            .validate_and_sanitize("secure/319985/r5.json", &ctx())
            .unwrap();
        assert_eq!(path.as_str(), "secure/319985/r5.json");
        assert_eq!(path.extension(), Some("json"));
        assert_eq!(path.segments().count(), 3);
    }

    #[test]
    fn test_traversal_rejected() {
        let resolver = resolver();
        for raw in [
            "../../etc/passwd",
            "/api/..%2F..%2Fetc",
            "a/..\\b",
            "data/%2E%2E/secret.json",
            "data/..%5cwin.json",
            "data/file.json%00",
            "data/\0.json",
            "data/%252e%252e/x.json",
            "a/../b.json",
        ] {
            let err = resolver.validate_and_sanitize(raw, &ctx()).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Security, "{:?}", raw);
            assert!(err.is_path_traversal(), "{:?}", raw);
        }
    }

    #[test]
    fn test_security_errors_do_not_echo_input() {
        let raw = "../../etc/passwd";
        let err = resolver().validate_and_sanitize(raw, &ctx()).unwrap_err();
        assert!(!err.to_string().contains("passwd"));
    }

    #[test]
    fn test_length_and_blank_validation() {
        let resolver = resolver();
        assert_eq!(
            resolver.validate_and_sanitize("", &ctx()).unwrap_err().class(),
            ErrorClass::Validation
        );
        assert_eq!(
            resolver.validate_and_sanitize("   ", &ctx()).unwrap_err().class(),
            ErrorClass::Validation
        );

        let long = format!("{}.json", "a".repeat(MAX_PATH_LENGTH));
        assert_eq!(
            resolver.validate_and_sanitize(&long, &ctx()).unwrap_err().class(),
            ErrorClass::Validation
        );

        let exact = format!("{}.json", "a".repeat(MAX_PATH_LENGTH - 5));
        assert!(resolver.validate_and_sanitize(&exact, &ctx()).is_ok());
    }

    #[test]
    fn test_invalid_characters() {
        let resolver = resolver();
        for raw in ["data/my file.json", "data/a;b.json", "data/ü.json", "data/a?.json", "data/./a.json"] {
            let err = resolver.validate_and_sanitize(raw, &ctx()).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Validation, "{:?}", raw);
        }
    }

    #[test]
    fn test_extension_whitelist() {
        let resolver = resolver();
        for raw in ["data/report.csv", "data/script", "data/.json", "data/dir/", "/"] {
            let err = resolver.validate_and_sanitize(raw, &ctx()).unwrap_err();
            assert!(
                matches!(err, GatewayError::Security(SecurityViolation::DisallowedExtension)),
                "{:?}",
                raw
            );
        }
    }

    #[test]
    fn test_normalization() {
        let resolver = resolver();
        let path = resolver
            .validate_and_sanitize("  //public///datasets//a.json ", &ctx())
            .unwrap();
        assert_eq!(path.as_str(), "public/datasets/a.json");

        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("///"), "/");
        assert_eq!(normalize("/a//b"), "a/b");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let resolver = resolver();
        for raw in ["/public//a.json", "secure/319985/r5.json", " x/y_z-1.json"] {
            let once = resolver.validate_and_sanitize(raw, &ctx()).unwrap();
            let twice = resolver.validate_and_sanitize(once.as_str(), &ctx()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_check_access_secure_prefix() {
        let resolver = resolver();
        let path = resolver
            .validate_and_sanitize("secure/319985/r5.json", &ctx())
            .unwrap();

        assert!(!resolver.check_access(&path, &ctx()).is_allowed());
        assert!(!resolver.check_access(&path, &user_ctx(Tier::Tier1)).is_allowed());
        assert!(resolver.check_access(&path, &user_ctx(Tier::Tier2)).is_allowed());
        assert!(resolver.check_access(&path, &user_ctx(Tier::Tier3)).is_allowed());

        let err = resolver
            .check_access(&path, &user_ctx(Tier::Tier1))
            .into_result()
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Forbidden);
    }

    #[test]
    fn test_check_access_anonymous() {
        let resolver = resolver();
        let public = resolver.validate_and_sanitize("public/a.json", &ctx()).unwrap();
        let private = resolver.validate_and_sanitize("datasets/a.json", &ctx()).unwrap();

        assert!(resolver.check_access(&public, &ctx()).is_allowed());
        assert!(!resolver.check_access(&private, &ctx()).is_allowed());
        assert!(resolver.check_access(&private, &user_ctx(Tier::Tier1)).is_allowed());
    }

    #[test]
    fn test_prefix_normalization() {
        let resolver = SecurePathResolver::new(AccessPolicy {
            allowed_extensions: vec![".json".to_string()],
            secure_prefix: "/vault".to_string(),
            secure_min_tier: Tier::Tier3,
            public_prefixes: vec!["open/".to_string()],
        });
        assert_eq!(resolver.policy().secure_prefix, "vault/");
        assert_eq!(resolver.policy().allowed_extensions, vec!["json".to_string()]);

        let path = resolver.validate_and_sanitize("vault/a.json", &ctx()).unwrap();
        assert!(!resolver.check_access(&path, &user_ctx(Tier::Tier2)).is_allowed());

        let not_vault = resolver.validate_and_sanitize("vaulted/a.json", &ctx()).unwrap();
        assert!(resolver.check_access(&not_vault, &user_ctx(Tier::Tier1)).is_allowed());
    }
}
