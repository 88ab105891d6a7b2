//! Turns feed transitions into listener events

use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;

use crate::codec::SegmentCodec;
use crate::event::EventType;
use crate::feed::{Transition, TransitionSource};
use crate::listeners::Dispatcher;
use crate::store::EntryStore;
use crate::view::LocalView;

/// Applies transitions to the local view and notifies listeners.
///
/// Reconciliation transitions are already reflected in the view and are
/// dispatched as-is. Channel transitions go through the view first so a
/// key is announced once per observed change, whichever feed sees it
/// first. Keys the codec cannot decode are ignored entirely.
pub struct EventPump<C: SegmentCodec> {
  store: Arc<dyn EntryStore>,
  view: Arc<LocalView>,
  dispatcher: Dispatcher<C>,
}

impl<C: SegmentCodec> EventPump<C> {
  pub fn new(store: Arc<dyn EntryStore>, view: Arc<LocalView>, dispatcher: Dispatcher<C>) -> Self {
    Self {
      store,
      view,
      dispatcher,
    }
  }

  /// Apply one transition. Returns the number of listeners notified.
  pub async fn apply(&self, transition: Transition) -> usize {
    let Some(header) = self.dispatcher.decode(&transition.key) else {
      tracing::debug!(
        "Ignoring {} transition for undecodable key",
        transition.kind
      );
      return 0;
    };
    let event_type = transition.kind.event_type();

    match transition.source {
      TransitionSource::Reconcile => self.dispatcher.notify(event_type, &header),
      TransitionSource::Channel => match event_type {
        EventType::Created => {
          if !self.view.mark_present(&transition.key) {
            return 0;
          }
          self.dispatcher.notify(event_type, &header)
        }
        EventType::Deleted => {
          // Keep the index in step with the store; reconciliation repairs
          // anything missed here
          if let Err(e) = self.store.remove_from_index(&transition.key).await {
            tracing::warn!(
              "Failed to drop {} key from index: {}",
              transition.kind,
              e
            );
          }
          if !self.view.mark_absent(&transition.key) {
            return 0;
          }
          self.dispatcher.notify(event_type, &header)
        }
      },
    }
  }

  /// Apply every transition from `feed` until it ends
  pub async fn run(self: Arc<Self>, mut feed: BoxStream<'static, Transition>) {
    while let Some(transition) = feed.next().await {
      self.apply(transition).await;
    }
    tracing::debug!("Change feed ended, event pump stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::JsonCodec;
  use crate::event::{SegmentCacheEvent, SegmentCacheListener};
  use crate::feed::TransitionKind;
  use crate::listeners::ListenerRegistry;
  use crate::store::InMemoryEntryStore;
  use parking_lot::Mutex;

  type Codec = JsonCodec<String, String>;

  #[derive(Default)]
  struct Recorder {
    events: Mutex<Vec<(EventType, String)>>,
  }

  impl SegmentCacheListener<String> for Recorder {
    fn handle(&self, event: SegmentCacheEvent<String>) -> anyhow::Result<()> {
      self
        .events
        .lock()
        .push((event.event_type(), event.into_source()));
      Ok(())
    }
  }

  struct Fixture {
    store: Arc<InMemoryEntryStore>,
    view: Arc<LocalView>,
    pump: EventPump<Codec>,
    recorder: Arc<Recorder>,
  }

  fn fixture() -> Fixture {
    let store = Arc::new(InMemoryEntryStore::new());
    let view = Arc::new(LocalView::new());
    let registry = Arc::new(ListenerRegistry::new());
    let recorder = Arc::new(Recorder::default());
    registry.add(recorder.clone());
    let dispatcher = Dispatcher::new(Arc::new(Codec::new()), registry);
    let pump = EventPump::new(store.clone(), view.clone(), dispatcher);
    Fixture {
      store,
      view,
      pump,
      recorder,
    }
  }

  fn key(header: &str) -> String {
    Codec::new().encode_header(&header.to_string()).unwrap()
  }

  #[tokio::test]
  async fn test_channel_created_is_announced_once() {
    let f = fixture();
    let k = key("h1");

    assert_eq!(
      f.pump
        .apply(Transition::from_channel(k.clone(), TransitionKind::Created))
        .await,
      1
    );
    assert_eq!(
      f.pump
        .apply(Transition::from_channel(k.clone(), TransitionKind::Created))
        .await,
      0
    );
    assert!(f.view.contains(&k));
    assert_eq!(f.recorder.events.lock().len(), 1);
  }

  #[tokio::test]
  async fn test_channel_removal_prunes_index() {
    let f = fixture();
    let k = key("h1");
    f.store.add_to_index(&k).await.unwrap();
    f.view.mark_present(&k);

    assert_eq!(
      f.pump
        .apply(Transition::from_channel(k.clone(), TransitionKind::Expired))
        .await,
      1
    );
    assert!(f.store.scan_index().await.unwrap().is_empty());
    assert!(!f.view.contains(&k));
    assert_eq!(
      *f.recorder.events.lock(),
      vec![(EventType::Deleted, "h1".to_string())]
    );
  }

  #[tokio::test]
  async fn test_reconcile_transitions_bypass_view() {
    let f = fixture();
    let k = key("h1");
    f.view.mark_present(&k);

    assert_eq!(
      f.pump
        .apply(Transition::from_reconcile(k, TransitionKind::Created))
        .await,
      1
    );
  }

  #[tokio::test]
  async fn test_undecodable_keys_do_not_touch_view_or_index() {
    let f = fixture();
    f.store.add_to_index("foreign").await.unwrap();

    f.pump
      .apply(Transition::from_channel("foreign".to_string(), TransitionKind::Created))
      .await;
    f.pump
      .apply(Transition::from_channel("foreign".to_string(), TransitionKind::Deleted))
      .await;

    assert!(f.view.is_empty());
    assert_eq!(f.store.scan_index().await.unwrap(), vec!["foreign"]);
    assert!(f.recorder.events.lock().is_empty());
  }
}
