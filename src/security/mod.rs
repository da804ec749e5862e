//! Request identity, token validation and secure path resolution.

mod context;
mod path;
mod token;

pub use context::{AuthenticatedUser, SecurityContext, ANONYMOUS_USER_ID};
pub use path::{AccessDecision, AccessPolicy, SanitizedPath, SecurePathResolver, MAX_PATH_LENGTH};
pub use token::{bearer_token, StaticTokenValidator, TokenEntry, TokenError, TokenValidator};
