//! Cache events and the listener contract

/// Kind of transition a listener is told about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
  Created,
  Deleted,
}

impl std::fmt::Display for EventType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EventType::Created => write!(f, "created"),
      EventType::Deleted => write!(f, "deleted"),
    }
  }
}

/// A single created/deleted notification about one header.
///
/// A fresh event is built for every listener on every delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCacheEvent<H> {
  event_type: EventType,
  source: H,
  local: bool,
}

impl<H> SegmentCacheEvent<H> {
  pub fn new(event_type: EventType, source: H, local: bool) -> Self {
    Self {
      event_type,
      source,
      local,
    }
  }

  /// Event observed through the shared store
  pub fn created(source: H) -> Self {
    Self::new(EventType::Created, source, false)
  }

  /// Event observed through the shared store
  pub fn deleted(source: H) -> Self {
    Self::new(EventType::Deleted, source, false)
  }

  pub fn event_type(&self) -> EventType {
    self.event_type
  }

  /// The header the event is about
  pub fn source(&self) -> &H {
    &self.source
  }

  pub fn into_source(self) -> H {
    self.source
  }

  /// Whether the transition originated in this process. Transitions are
  /// only ever learned through the shared store, so this is always false
  /// for events produced by the cache.
  pub fn is_local(&self) -> bool {
    self.local
  }
}

/// Observer of cache transitions.
///
/// Handlers run synchronously on the task that observed the transition and
/// must tolerate duplicates. An error (or panic) is logged and does not
/// affect delivery to other listeners.
pub trait SegmentCacheListener<H>: Send + Sync {
  fn handle(&self, event: SegmentCacheEvent<H>) -> anyhow::Result<()>;
}

impl<H, F> SegmentCacheListener<H> for F
where
  F: Fn(SegmentCacheEvent<H>) -> anyhow::Result<()> + Send + Sync,
{
  fn handle(&self, event: SegmentCacheEvent<H>) -> anyhow::Result<()> {
    self(event)
  }
}
