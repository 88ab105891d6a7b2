//! Listener registry and event dispatch

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::codec::SegmentCodec;
use crate::event::{EventType, SegmentCacheEvent, SegmentCacheListener};

/// A registered listener. Identity is the allocation, so registering the
/// same `Arc` twice is a no-op and removal needs the same `Arc`.
pub type SharedListener<H> = Arc<dyn SegmentCacheListener<H>>;

fn listener_id<H>(listener: &SharedListener<H>) -> usize {
  Arc::as_ptr(listener) as *const () as usize
}

/// Set of registered listeners, safe to mutate while a dispatch is running
pub struct ListenerRegistry<H> {
  listeners: RwLock<HashMap<usize, SharedListener<H>>>,
}

impl<H> Default for ListenerRegistry<H> {
  fn default() -> Self {
    Self::new()
  }
}

impl<H> ListenerRegistry<H> {
  pub fn new() -> Self {
    Self {
      listeners: RwLock::new(HashMap::new()),
    }
  }

  /// Returns false if the listener was already registered
  pub fn add(&self, listener: SharedListener<H>) -> bool {
    let id = listener_id(&listener);
    let mut listeners = self.listeners.write();
    if listeners.contains_key(&id) {
      return false;
    }
    listeners.insert(id, listener);
    true
  }

  /// Returns false if the listener was not registered
  pub fn remove(&self, listener: &SharedListener<H>) -> bool {
    self
      .listeners
      .write()
      .remove(&listener_id(listener))
      .is_some()
  }

  pub fn contains(&self, listener: &SharedListener<H>) -> bool {
    self.listeners.read().contains_key(&listener_id(listener))
  }

  pub fn len(&self) -> usize {
    self.listeners.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.listeners.read().is_empty()
  }

  pub fn clear(&self) {
    self.listeners.write().clear();
  }

  /// Listeners registered right now. Dispatch iterates this copy so no lock
  /// is held while handlers run.
  pub fn snapshot(&self) -> Vec<SharedListener<H>> {
    self.listeners.read().values().cloned().collect()
  }
}

/// Deliver one event to one listener, containing any failure.
/// Returns whether the listener accepted it.
fn deliver<H>(listener: &SharedListener<H>, event: SegmentCacheEvent<H>) -> bool {
  let event_type = event.event_type();
  match catch_unwind(AssertUnwindSafe(|| listener.handle(event))) {
    Ok(Ok(())) => true,
    Ok(Err(e)) => {
      tracing::warn!("Listener failed to handle {} event: {:#}", event_type, e);
      false
    }
    Err(_) => {
      tracing::warn!("Listener panicked while handling {} event", event_type);
      false
    }
  }
}

/// Turns encoded keys into events for every registered listener
pub struct Dispatcher<C: SegmentCodec> {
  codec: Arc<C>,
  registry: Arc<ListenerRegistry<C::Header>>,
}

impl<C: SegmentCodec> Clone for Dispatcher<C> {
  fn clone(&self) -> Self {
    Self {
      codec: self.codec.clone(),
      registry: self.registry.clone(),
    }
  }
}

impl<C: SegmentCodec> Dispatcher<C> {
  pub fn new(codec: Arc<C>, registry: Arc<ListenerRegistry<C::Header>>) -> Self {
    Self { codec, registry }
  }

  pub fn registry(&self) -> &Arc<ListenerRegistry<C::Header>> {
    &self.registry
  }

  pub fn dispatch_created(&self, key: &str) -> usize {
    self.dispatch(EventType::Created, key)
  }

  pub fn dispatch_deleted(&self, key: &str) -> usize {
    self.dispatch(EventType::Deleted, key)
  }

  /// Decode `key` and notify every listener. Keys that do not decode are
  /// dropped. Returns the number of listeners that accepted the event.
  pub fn dispatch(&self, event_type: EventType, key: &str) -> usize {
    let Some(header) = self.decode(key) else {
      tracing::debug!("Dropping {} event for undecodable key", event_type);
      return 0;
    };
    self.notify(event_type, &header)
  }

  pub fn decode(&self, key: &str) -> Option<C::Header> {
    self.codec.decode_header(key)
  }

  /// Notify every listener about an already decoded header
  pub fn notify(&self, event_type: EventType, header: &C::Header) -> usize {
    self
      .registry
      .snapshot()
      .iter()
      .filter(|listener| {
        deliver(
          listener,
          SegmentCacheEvent::new(event_type, header.clone(), false),
        )
      })
      .count()
  }

  /// Notify a single listener, bypassing the registry
  pub fn deliver_to(
    &self,
    listener: &SharedListener<C::Header>,
    event_type: EventType,
    header: C::Header,
  ) -> bool {
    deliver(listener, SegmentCacheEvent::new(event_type, header, false))
  }
}
