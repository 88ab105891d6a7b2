//! In-process entry store
//!
//! Mirrors the parts of Redis the cache relies on: string values with TTL,
//! one server-side set, pub/sub channels and key-event notifications
//! (`set`, `del`, `expired`, `evicted`).

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{key_event_channel, EntryStore, DEFAULT_INDEX_KEY};
use crate::error::{CacheError, CacheResult};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredEntry {
  value: String,
  expires_at: Option<Instant>,
}

impl StoredEntry {
  fn new(value: String, ttl: Option<Duration>) -> Self {
    Self {
      value,
      expires_at: ttl.map(|d| Instant::now() + d),
    }
  }

  fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() >= exp)
      .unwrap_or(false)
  }
}

/// Store counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
  pub keys: usize,
  pub index_members: usize,
  pub expired: u64,
  pub evicted: u64,
}

/// In-memory [`EntryStore`]
pub struct InMemoryEntryStore {
  data: RwLock<HashMap<String, StoredEntry>>,
  index: RwLock<HashSet<String>>,
  channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
  index_key: String,
  database: i64,
  notify_key_events: AtomicBool,
  available: AtomicBool,
  expired: AtomicU64,
  evicted: AtomicU64,
}

impl Default for InMemoryEntryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryEntryStore {
  /// Store on database 0 with the default index key and key events enabled
  pub fn new() -> Self {
    Self::with_options(DEFAULT_INDEX_KEY, 0, true)
  }

  pub fn with_options(index_key: &str, database: i64, notify_key_events: bool) -> Self {
    Self {
      data: RwLock::new(HashMap::new()),
      index: RwLock::new(HashSet::new()),
      channels: RwLock::new(HashMap::new()),
      index_key: index_key.to_string(),
      database,
      notify_key_events: AtomicBool::new(notify_key_events),
      available: AtomicBool::new(true),
      expired: AtomicU64::new(0),
      evicted: AtomicU64::new(0),
    }
  }

  /// Toggle key-event notifications (Redis `notify-keyspace-events`)
  pub fn set_notify_key_events(&self, enabled: bool) {
    self.notify_key_events.store(enabled, Ordering::SeqCst);
  }

  /// Simulate losing (or regaining) the store. While unavailable every
  /// operation fails, and going down drops all live subscriptions.
  pub fn set_available(&self, available: bool) {
    self.available.store(available, Ordering::SeqCst);
    if !available {
      self.channels.write().clear();
    }
  }

  /// End every subscription on one channel, leaving the others intact
  pub fn disconnect_channel(&self, channel: &str) {
    self.channels.write().remove(channel);
  }

  /// Number of live subscribers on a channel
  pub fn subscriber_count(&self, channel: &str) -> usize {
    self
      .channels
      .read()
      .get(channel)
      .map(|tx| tx.receiver_count())
      .unwrap_or(0)
  }

  /// Expire a key immediately, as if its TTL had run out
  pub fn expire_now(&self, key: &str) -> bool {
    let removed = self.data.write().remove(key).is_some();
    if removed {
      self.expired.fetch_add(1, Ordering::Relaxed);
      self.emit_key_event("expired", key);
    }
    removed
  }

  /// Evict a key, as the store would under memory pressure
  pub fn evict(&self, key: &str) -> bool {
    let removed = self.data.write().remove(key).is_some();
    if removed {
      self.evicted.fetch_add(1, Ordering::Relaxed);
      self.emit_key_event("evicted", key);
    }
    removed
  }

  /// Remove every expired entry, announcing each one. Returns the count.
  pub fn purge_expired(&self) -> usize {
    let expired_keys: Vec<String> = {
      let mut data = self.data.write();
      let keys: Vec<String> = data
        .iter()
        .filter(|(_, entry)| entry.is_expired())
        .map(|(k, _)| k.clone())
        .collect();
      for key in &keys {
        data.remove(key);
      }
      keys
    };

    for key in &expired_keys {
      self.expired.fetch_add(1, Ordering::Relaxed);
      self.emit_key_event("expired", key);
    }
    expired_keys.len()
  }

  pub fn stats(&self) -> MemoryStoreStats {
    MemoryStoreStats {
      keys: self.data.read().values().filter(|e| !e.is_expired()).count(),
      index_members: self.index.read().len(),
      expired: self.expired.load(Ordering::Relaxed),
      evicted: self.evicted.load(Ordering::Relaxed),
    }
  }

  fn check_available(&self) -> CacheResult<()> {
    if self.available.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(CacheError::StoreUnavailable(
        "in-memory store is offline".to_string(),
      ))
    }
  }

  fn emit_key_event(&self, event: &str, key: &str) {
    if !self.notify_key_events.load(Ordering::SeqCst) {
      return;
    }
    let channel = key_event_channel(self.database, event);
    if let Some(tx) = self.channels.read().get(&channel) {
      let _ = tx.send(key.to_string());
    }
  }

  /// Live entry for `key`, dropping (and announcing) it if it has expired
  fn live_entry(&self, key: &str) -> Option<StoredEntry> {
    let expired = {
      let data = self.data.read();
      match data.get(key) {
        Some(entry) if !entry.is_expired() => return Some(entry.clone()),
        Some(_) => true,
        None => false,
      }
    };

    if expired && self.data.write().remove(key).is_some() {
      self.expired.fetch_add(1, Ordering::Relaxed);
      self.emit_key_event("expired", key);
    }
    None
  }

  fn write(&self, key: &str, blob: &str, ttl: Option<Duration>) {
    self
      .data
      .write()
      .insert(key.to_string(), StoredEntry::new(blob.to_string(), ttl));
    self.emit_key_event("set", key);
  }
}

fn receiver_stream(rx: broadcast::Receiver<String>) -> BoxStream<'static, String> {
  stream::unfold(rx, |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(msg) => return Some((msg, rx)),
        Err(broadcast::error::RecvError::Lagged(n)) => {
          tracing::warn!("Subscriber lagged, {} messages dropped", n);
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  })
  .boxed()
}

#[async_trait]
impl EntryStore for InMemoryEntryStore {
  fn index_key(&self) -> &str {
    &self.index_key
  }

  fn database(&self) -> i64 {
    self.database
  }

  async fn get(&self, key: &str) -> CacheResult<Option<String>> {
    self.check_available()?;
    Ok(self.live_entry(key).map(|e| e.value))
  }

  async fn set(&self, key: &str, blob: &str) -> CacheResult<bool> {
    self.check_available()?;
    self.write(key, blob, None);
    Ok(true)
  }

  async fn set_with_expiry(&self, key: &str, blob: &str, ttl_secs: u64) -> CacheResult<bool> {
    self.check_available()?;
    if ttl_secs == 0 {
      return Err(CacheError::StoreUnavailable(
        "invalid expire time in 'set' command".to_string(),
      ));
    }
    self.write(key, blob, Some(Duration::from_secs(ttl_secs)));
    Ok(true)
  }

  async fn delete(&self, key: &str) -> CacheResult<u64> {
    self.check_available()?;

    if key == self.index_key {
      let mut index = self.index.write();
      let existed = !index.is_empty();
      index.clear();
      drop(index);
      if existed {
        self.emit_key_event("del", key);
      }
      return Ok(existed as u64);
    }

    let removed = match self.data.write().remove(key) {
      Some(entry) => !entry.is_expired(),
      None => false,
    };
    if removed {
      self.emit_key_event("del", key);
    }
    Ok(removed as u64)
  }

  async fn exists(&self, key: &str) -> CacheResult<bool> {
    self.check_available()?;
    if key == self.index_key {
      return Ok(!self.index.read().is_empty());
    }
    Ok(self.live_entry(key).is_some())
  }

  async fn add_to_index(&self, key: &str) -> CacheResult<bool> {
    self.check_available()?;
    Ok(self.index.write().insert(key.to_string()))
  }

  async fn remove_from_index(&self, key: &str) -> CacheResult<bool> {
    self.check_available()?;
    Ok(self.index.write().remove(key))
  }

  async fn scan_index(&self) -> CacheResult<Vec<String>> {
    self.check_available()?;
    Ok(self.index.read().iter().cloned().collect())
  }

  async fn publish(&self, channel: &str, message: &str) -> CacheResult<u64> {
    self.check_available()?;
    let delivered = match self.channels.read().get(channel) {
      Some(tx) => tx.send(message.to_string()).unwrap_or(0),
      None => 0,
    };
    Ok(delivered as u64)
  }

  async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>> {
    self.check_available()?;
    let rx = self
      .channels
      .write()
      .entry(channel.to_string())
      .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
      .subscribe();
    Ok(receiver_stream(rx))
  }
}
