//! HTTP data access gateway.

mod response;
mod server;
mod service;
mod store;

pub use response::{
    apply_rate_limit_headers, content_etag, http_date, is_not_modified, parse_http_date,
    status_for, ApiError, ProblemDetails,
};
pub use server::{spawn_retention_sweep, GatewayServer};
pub use service::{build_router, AppState, GatewayState, DATA_ROUTE_PREFIX};
pub use store::{DataFile, DataStore, FsDataStore};
