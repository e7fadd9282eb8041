pub mod api;
pub mod cache;
pub mod client;
pub mod discovery;
pub mod kube_client;
pub mod namespaces;
pub mod resource;
pub mod search;
pub mod utils;

/// Default user agent - automatically uses the package version
///
/// Override with the `NAVICACHE_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
