//! Entry store clients
//!
//! Thin wrappers over the shared key/value store. Every operation is atomic
//! per key; nothing here spans keys. Any failure is reported as
//! [`CacheError::StoreUnavailable`](crate::error::CacheError) and must be
//! read as "state unknown".

mod memory;
mod redis_client;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::CacheResult;

pub use self::memory::{InMemoryEntryStore, MemoryStoreStats};
pub use self::redis_client::RedisEntryStore;

/// Default name of the shared index set
pub const DEFAULT_INDEX_KEY: &str = "SEGMENT_HEADERS_SET";

/// Channel a store publishes `event` notifications on for database `db`
pub fn key_event_channel(db: i64, event: &str) -> String {
  format!("__keyevent@{}__:{}", db, event)
}

/// Operations the cache needs from the shared store
#[async_trait]
pub trait EntryStore: Send + Sync {
  /// Name of the set holding every encoded key
  fn index_key(&self) -> &str;

  /// Logical database / namespace selected by this client
  fn database(&self) -> i64;

  async fn get(&self, key: &str) -> CacheResult<Option<String>>;

  /// Write without expiry. Returns whether the store acknowledged the write.
  async fn set(&self, key: &str, blob: &str) -> CacheResult<bool>;

  /// Write with a TTL in seconds
  async fn set_with_expiry(&self, key: &str, blob: &str, ttl_secs: u64) -> CacheResult<bool>;

  /// Number of keys actually removed
  async fn delete(&self, key: &str) -> CacheResult<u64>;

  async fn exists(&self, key: &str) -> CacheResult<bool>;

  /// Returns true if the key was newly added
  async fn add_to_index(&self, key: &str) -> CacheResult<bool>;

  /// Returns true if the key was a member
  async fn remove_from_index(&self, key: &str) -> CacheResult<bool>;

  /// Every member of the index set. Each call is an independent pass.
  async fn scan_index(&self) -> CacheResult<Vec<String>>;

  /// Number of subscribers that received the message
  async fn publish(&self, channel: &str, message: &str) -> CacheResult<u64>;

  /// Messages published on `channel` from now on. The stream ends when the
  /// underlying subscription is lost.
  async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>>;

  /// Ask the store to publish key-event notifications, where supported
  async fn enable_key_events(&self) -> CacheResult<()> {
    Ok(())
  }
}
