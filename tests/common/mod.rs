//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use segment_cache::feed::TransitionKind;
use segment_cache::store::key_event_channel;
use segment_cache::{
  CacheResult, EntryStore, EventType, InMemoryEntryStore, JsonCodec, SegmentCacheEvent,
  SegmentCacheListener, SegmentCodec,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
  pub cube: String,
  pub measure: String,
}

pub fn header(measure: &str) -> Header {
  Header {
    cube: "Sales".to_string(),
    measure: measure.to_string(),
  }
}

pub type Codec = JsonCodec<Header, Vec<f64>>;

pub fn encoded(h: &Header) -> String {
  Codec::new().encode_header(h).unwrap()
}

/// Listener that records every event it is handed
#[derive(Default)]
pub struct Recorder {
  events: Mutex<Vec<(EventType, Header)>>,
}

impl Recorder {
  pub fn events(&self) -> Vec<(EventType, Header)> {
    self.events.lock().clone()
  }

  pub fn count(&self, event_type: EventType, h: &Header) -> usize {
    self
      .events
      .lock()
      .iter()
      .filter(|(t, seen)| *t == event_type && seen == h)
      .count()
  }

  pub fn created(&self, h: &Header) -> usize {
    self.count(EventType::Created, h)
  }

  pub fn deleted(&self, h: &Header) -> usize {
    self.count(EventType::Deleted, h)
  }

  pub fn len(&self) -> usize {
    self.events.lock().len()
  }
}

impl SegmentCacheListener<Header> for Recorder {
  fn handle(&self, event: SegmentCacheEvent<Header>) -> anyhow::Result<()> {
    assert!(!event.is_local());
    self
      .events
      .lock()
      .push((event.event_type(), event.into_source()));
    Ok(())
  }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  while tokio::time::Instant::now() < deadline {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  check()
}

/// Wait until every key-event channel has at least `n` subscribers
pub async fn subscribed(store: &InMemoryEntryStore, n: usize) -> bool {
  let channels: Vec<String> = TransitionKind::ALL
    .iter()
    .map(|kind| key_event_channel(store.database(), kind.event_name()))
    .collect();
  eventually(|| channels.iter().all(|c| store.subscriber_count(c) >= n)).await
}

/// Store whose index scans take `delay`
pub struct SlowStore {
  pub inner: Arc<InMemoryEntryStore>,
  pub delay: Duration,
}

impl SlowStore {
  pub fn new(inner: Arc<InMemoryEntryStore>, delay: Duration) -> Self {
    Self { inner, delay }
  }
}

#[async_trait]
impl EntryStore for SlowStore {
  fn index_key(&self) -> &str {
    self.inner.index_key()
  }

  fn database(&self) -> i64 {
    self.inner.database()
  }

  async fn get(&self, key: &str) -> CacheResult<Option<String>> {
    self.inner.get(key).await
  }

  async fn set(&self, key: &str, blob: &str) -> CacheResult<bool> {
    self.inner.set(key, blob).await
  }

  async fn set_with_expiry(&self, key: &str, blob: &str, ttl_secs: u64) -> CacheResult<bool> {
    self.inner.set_with_expiry(key, blob, ttl_secs).await
  }

  async fn delete(&self, key: &str) -> CacheResult<u64> {
    self.inner.delete(key).await
  }

  async fn exists(&self, key: &str) -> CacheResult<bool> {
    self.inner.exists(key).await
  }

  async fn add_to_index(&self, key: &str) -> CacheResult<bool> {
    self.inner.add_to_index(key).await
  }

  async fn remove_from_index(&self, key: &str) -> CacheResult<bool> {
    self.inner.remove_from_index(key).await
  }

  async fn scan_index(&self) -> CacheResult<Vec<String>> {
    tokio::time::sleep(self.delay).await;
    self.inner.scan_index().await
  }

  async fn publish(&self, channel: &str, message: &str) -> CacheResult<u64> {
    self.inner.publish(channel, message).await
  }

  async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>> {
    self.inner.subscribe(channel).await
  }
}
