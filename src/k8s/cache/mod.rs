pub mod cached_data;
pub mod config;
pub mod data_cache;
pub mod subscription;
pub mod watch_manager;

pub use cached_data::CacheEntry;
pub use config::{CacheConfig, REFRESH_RESOURCE_TYPES};
pub use data_cache::{CacheStats, EntrySnapshot, TtlCache};
pub use subscription::{Subscription, WatchCallback, WatchEvent, WatchKey};
pub use watch_manager::{ErrorHandler, WatchStats, WatchStatus, Watcher};
