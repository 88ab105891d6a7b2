//! Push feed over the store's key-event channels

use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{receiver_stream, ChangeFeed, Transition, TransitionKind, FEED_BUFFER};
use crate::store::{key_event_channel, EntryStore};

/// One independent subscription per transition kind. A channel whose
/// subscription fails or drops is resubscribed after `backoff`, without
/// affecting the other channels.
pub struct KeyEventFeed {
  store: Arc<dyn EntryStore>,
  backoff: Duration,
}

impl KeyEventFeed {
  pub fn new(store: Arc<dyn EntryStore>, backoff: Duration) -> Self {
    Self { store, backoff }
  }

  /// Channel name for a transition kind, derived from the store's database
  pub fn channel(&self, kind: TransitionKind) -> String {
    key_event_channel(self.store.database(), kind.event_name())
  }

  async fn run_channel(
    &self,
    kind: TransitionKind,
    tx: mpsc::Sender<Transition>,
    mut shutdown: watch::Receiver<bool>,
  ) {
    let channel = self.channel(kind);

    loop {
      if *shutdown.borrow() {
        return;
      }

      match self.store.subscribe(&channel).await {
        Ok(mut messages) => {
          tracing::debug!("Subscribed to {}", channel);
          loop {
            tokio::select! {
              msg = messages.next() => match msg {
                Some(key) => {
                  if tx.send(Transition::from_channel(key, kind)).await.is_err() {
                    return;
                  }
                }
                None => {
                  tracing::warn!("Lost subscription to {}, resubscribing", channel);
                  break;
                }
              },
              _ = shutdown.changed() => return,
            }
          }
        }
        Err(e) => {
          tracing::warn!("Failed to subscribe to {}: {}", channel, e);
        }
      }

      tokio::select! {
        _ = tokio::time::sleep(self.backoff) => {}
        _ = shutdown.changed() => return,
      }
    }
  }
}

impl ChangeFeed for KeyEventFeed {
  fn name(&self) -> &'static str {
    "key-events"
  }

  fn observe(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> BoxStream<'static, Transition> {
    let (tx, rx) = mpsc::channel(FEED_BUFFER);

    for kind in TransitionKind::ALL {
      let feed = self.clone();
      let tx = tx.clone();
      let shutdown = shutdown.clone();
      tokio::spawn(async move {
        feed.run_channel(kind, tx, shutdown).await;
        tracing::debug!("Key-event listener for {} stopped", kind);
      });
    }

    receiver_stream(rx)
  }
}
