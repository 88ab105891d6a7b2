//! Change feeds
//!
//! A change feed is how a process learns that something changed in the
//! shared store. Two strategies exist and can run side by side:
//!
//! - [`KeyEventFeed`]: push, one long-lived subscription per key-event
//!   channel (`set`, `del`, `expired`, `evicted`)
//! - [`ReconcileFeed`]: pull, a periodic full reconciliation of the index
//!
//! Both produce the same stream of [`Transition`]s, consumed by the
//! [`EventPump`](crate::pump::EventPump).

mod keyevent;
mod reconcile;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::event::EventType;
use crate::store::EntryStore;
use crate::sync::IndexSynchronizer;

pub use keyevent::KeyEventFeed;
pub use reconcile::ReconcileFeed;

/// Capacity of the channel between feed tasks and the pump
const FEED_BUFFER: usize = 1024;

/// Store-level transition kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
  Created,
  Deleted,
  Expired,
  Evicted,
}

impl TransitionKind {
  pub const ALL: [TransitionKind; 4] = [
    TransitionKind::Created,
    TransitionKind::Deleted,
    TransitionKind::Expired,
    TransitionKind::Evicted,
  ];

  /// Name of the store's key event for this transition
  pub fn event_name(&self) -> &'static str {
    match self {
      TransitionKind::Created => "set",
      TransitionKind::Deleted => "del",
      TransitionKind::Expired => "expired",
      TransitionKind::Evicted => "evicted",
    }
  }

  /// Deleted, expired and evicted all mean the entry is gone
  pub fn is_removal(&self) -> bool {
    !matches!(self, TransitionKind::Created)
  }

  /// Listener-visible event type
  pub fn event_type(&self) -> EventType {
    if self.is_removal() {
      EventType::Deleted
    } else {
      EventType::Created
    }
  }
}

impl std::fmt::Display for TransitionKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TransitionKind::Created => write!(f, "created"),
      TransitionKind::Deleted => write!(f, "deleted"),
      TransitionKind::Expired => write!(f, "expired"),
      TransitionKind::Evicted => write!(f, "evicted"),
    }
  }
}

/// Where a transition was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSource {
  /// A key-event channel message; the local view has not seen it yet
  Channel,
  /// A reconciliation delta; the local view already reflects it
  Reconcile,
}

/// One observed change to one encoded key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
  pub key: String,
  pub kind: TransitionKind,
  pub source: TransitionSource,
}

impl Transition {
  pub fn from_channel(key: String, kind: TransitionKind) -> Self {
    Self {
      key,
      kind,
      source: TransitionSource::Channel,
    }
  }

  pub fn from_reconcile(key: String, kind: TransitionKind) -> Self {
    Self {
      key,
      kind,
      source: TransitionSource::Reconcile,
    }
  }
}

/// Which feeds a cache instance runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
  /// Key-event channels only
  Push,
  /// Periodic reconciliation only
  Pull,
  /// Both
  #[default]
  Hybrid,
}

impl std::fmt::Display for FeedMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FeedMode::Push => write!(f, "push"),
      FeedMode::Pull => write!(f, "pull"),
      FeedMode::Hybrid => write!(f, "hybrid"),
    }
  }
}

impl std::str::FromStr for FeedMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "push" | "pubsub" | "events" => Ok(FeedMode::Push),
      "pull" | "poll" | "reconcile" => Ok(FeedMode::Pull),
      "hybrid" | "both" => Ok(FeedMode::Hybrid),
      _ => Err(format!("Unknown feed mode: {}", s)),
    }
  }
}

/// A source of transitions.
///
/// `observe` starts whatever background work the feed needs and returns
/// the stream of transitions it produces. The stream ends once `shutdown`
/// flips to `true` (or its sender is dropped) and the feed's tasks exit.
pub trait ChangeFeed: Send + Sync {
  fn name(&self) -> &'static str;

  fn observe(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> BoxStream<'static, Transition>;
}

/// Several feeds merged into one stream
pub struct CombinedFeed {
  feeds: Vec<Arc<dyn ChangeFeed>>,
}

impl CombinedFeed {
  pub fn new(feeds: Vec<Arc<dyn ChangeFeed>>) -> Self {
    Self { feeds }
  }
}

impl ChangeFeed for CombinedFeed {
  fn name(&self) -> &'static str {
    "combined"
  }

  fn observe(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> BoxStream<'static, Transition> {
    let streams: Vec<BoxStream<'static, Transition>> = self
      .feeds
      .iter()
      .map(|feed| feed.clone().observe(shutdown.clone()))
      .collect();
    stream::select_all(streams).boxed()
  }
}

/// Timing knobs shared by the feeds
#[derive(Debug, Clone, Copy)]
pub struct FeedTiming {
  pub reconcile_interval: Duration,
  pub reconcile_timeout: Duration,
  pub resubscribe_backoff: Duration,
}

/// Build the feed for `mode`
pub fn build_feed(
  mode: FeedMode,
  store: Arc<dyn EntryStore>,
  synchronizer: Arc<IndexSynchronizer>,
  timing: FeedTiming,
) -> Arc<dyn ChangeFeed> {
  let push = || -> Arc<dyn ChangeFeed> {
    Arc::new(KeyEventFeed::new(store.clone(), timing.resubscribe_backoff))
  };
  let pull = || -> Arc<dyn ChangeFeed> {
    Arc::new(ReconcileFeed::new(
      synchronizer.clone(),
      timing.reconcile_interval,
      timing.reconcile_timeout,
    ))
  };

  match mode {
    FeedMode::Push => push(),
    FeedMode::Pull => pull(),
    FeedMode::Hybrid => Arc::new(CombinedFeed::new(vec![push(), pull()])),
  }
}

/// Adapt an mpsc receiver into a stream
fn receiver_stream(rx: mpsc::Receiver<Transition>) -> BoxStream<'static, Transition> {
  stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|t| (t, rx)) }).boxed()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transition_kinds() {
    let names: Vec<&str> = TransitionKind::ALL.iter().map(|k| k.event_name()).collect();
    assert_eq!(names, vec!["set", "del", "expired", "evicted"]);

    assert_eq!(TransitionKind::Created.event_type(), EventType::Created);
    for kind in [
      TransitionKind::Deleted,
      TransitionKind::Expired,
      TransitionKind::Evicted,
    ] {
      assert!(kind.is_removal());
      assert_eq!(kind.event_type(), EventType::Deleted);
    }
  }

  #[test]
  fn test_feed_mode_parse() {
    assert_eq!("push".parse::<FeedMode>().unwrap(), FeedMode::Push);
    assert_eq!("Reconcile".parse::<FeedMode>().unwrap(), FeedMode::Pull);
    assert_eq!("both".parse::<FeedMode>().unwrap(), FeedMode::Hybrid);
    assert!("sometimes".parse::<FeedMode>().is_err());
    assert_eq!(FeedMode::default(), FeedMode::Hybrid);
  }
}
