//! Pull feed driven by periodic reconciliation

use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::{receiver_stream, ChangeFeed, Transition, FEED_BUFFER};
use crate::sync::{IndexSynchronizer, ReconcileOutcome};

/// Runs a reconciliation every `interval` (first one after one interval)
/// and emits its delta. A failed or timed-out pass is logged and retried
/// on the next tick.
pub struct ReconcileFeed {
  synchronizer: Arc<IndexSynchronizer>,
  interval: Duration,
  timeout: Duration,
}

impl ReconcileFeed {
  pub fn new(synchronizer: Arc<IndexSynchronizer>, interval: Duration, timeout: Duration) -> Self {
    Self {
      synchronizer,
      interval,
      timeout,
    }
  }

  async fn run(&self, tx: mpsc::Sender<Transition>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      if *shutdown.borrow() {
        return;
      }

      tokio::select! {
        _ = ticker.tick() => {
          match self.synchronizer.reconcile_with_timeout(self.timeout).await {
            Ok(ReconcileOutcome::Completed(report)) => {
              for transition in report.transitions() {
                if tx.send(transition).await.is_err() {
                  return;
                }
              }
            }
            Ok(ReconcileOutcome::Skipped) => {}
            Err(e) => {
              tracing::warn!(
                "Reconciliation failed, retrying in {:?}: {}",
                self.interval,
                e
              );
            }
          }
        }
        _ = shutdown.changed() => return,
      }
    }
  }
}

impl ChangeFeed for ReconcileFeed {
  fn name(&self) -> &'static str {
    "reconcile"
  }

  fn observe(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> BoxStream<'static, Transition> {
    let (tx, rx) = mpsc::channel(FEED_BUFFER);
    tokio::spawn(async move {
      self.run(tx, shutdown).await;
      tracing::debug!("Reconciliation loop stopped");
    });
    receiver_stream(rx)
  }
}
