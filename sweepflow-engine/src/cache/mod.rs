// Content Cache Module
// Dependency-closed keys and the on-disk result store

pub mod key;
pub mod store;

// Re-export key types
pub use key::{cache_key, compute_key, file_digest, CacheKey, KeyInput};
pub use store::{CacheEntry, CacheError, ContentCache, ContentCacheConfig, Lookup};
