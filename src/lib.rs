pub mod cache_manager;
pub mod error;
pub mod k8s;

pub use cache_manager::CacheManager;
pub use error::{Error, Result};
pub use k8s::cache::CacheConfig;
pub use k8s::search::SearchFilters;
