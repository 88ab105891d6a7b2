//! Index reconciliation
//!
//! One pass walks the shared index, keeps the members whose entry still
//! exists, prunes the rest from the index and swaps the survivors into the
//! local view. The difference against the previous view is what listeners
//! get told about.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::{CacheError, CacheResult};
use crate::feed::{Transition, TransitionKind};
use crate::store::EntryStore;
use crate::view::{LocalView, ViewDelta};

/// Result of one completed reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Index members seen
  pub scanned: usize,
  /// Members whose entry was gone and were removed from the index
  pub pruned: usize,
  /// Members whose entry exists
  pub present: usize,
  pub delta: ViewDelta,
}

impl ReconcileReport {
  /// Delta as transitions, creations first
  pub fn transitions(&self) -> Vec<Transition> {
    let created = self
      .delta
      .created
      .iter()
      .map(|key| Transition::from_reconcile(key.clone(), TransitionKind::Created));
    let deleted = self
      .delta
      .deleted
      .iter()
      .map(|key| Transition::from_reconcile(key.clone(), TransitionKind::Deleted));
    created.chain(deleted).collect()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
  Completed(ReconcileReport),
  /// Another pass was already running
  Skipped,
}

pub struct IndexSynchronizer {
  store: Arc<dyn EntryStore>,
  view: Arc<LocalView>,
  running: Mutex<()>,
}

impl IndexSynchronizer {
  pub fn new(store: Arc<dyn EntryStore>, view: Arc<LocalView>) -> Self {
    Self {
      store,
      view,
      running: Mutex::new(()),
    }
  }

  pub fn view(&self) -> &Arc<LocalView> {
    &self.view
  }

  /// Run one pass. At most one pass runs at a time per synchronizer; a
  /// call that finds one in flight returns [`ReconcileOutcome::Skipped`].
  ///
  /// On a store error the view is left exactly as it was.
  pub async fn reconcile(&self) -> CacheResult<ReconcileOutcome> {
    let Ok(_guard) = self.running.try_lock() else {
      tracing::debug!("Reconciliation already in progress, skipping");
      return Ok(ReconcileOutcome::Skipped);
    };

    let start = Instant::now();
    let members = self.store.scan_index().await?;
    let scanned = members.len();

    let mut observed = HashSet::with_capacity(scanned);
    let mut pruned = 0;
    for key in members {
      if self.store.exists(&key).await? {
        observed.insert(key);
      } else if self.prune(&key).await? {
        pruned += 1;
      } else {
        // Written again between the check and the prune
        observed.insert(key);
      }
    }

    let present = observed.len();
    let delta = self.view.replace(observed);

    tracing::debug!(
      "Reconciled {} index members in {:?}: {} present, {} pruned, {} created, {} deleted",
      scanned,
      start.elapsed(),
      present,
      pruned,
      delta.created.len(),
      delta.deleted.len()
    );

    Ok(ReconcileOutcome::Completed(ReconcileReport {
      scanned,
      pruned,
      present,
      delta,
    }))
  }

  /// [`reconcile`](Self::reconcile) bounded by `timeout`
  pub async fn reconcile_with_timeout(&self, timeout: Duration) -> CacheResult<ReconcileOutcome> {
    match tokio::time::timeout(timeout, self.reconcile()).await {
      Ok(result) => result,
      Err(_) => Err(CacheError::Timeout(timeout)),
    }
  }

  /// Remove a dead key from the index. Returns false if the entry turned
  /// out to be live again, in which case the index membership is restored.
  ///
  /// Runs on its own task so that dropping the pass (a timeout) cannot stop
  /// between the removal and the restore.
  async fn prune(&self, key: &str) -> CacheResult<bool> {
    let store = self.store.clone();
    let key = key.to_string();
    let task = tokio::spawn(async move {
      store.remove_from_index(&key).await?;
      if store.exists(&key).await? {
        store.add_to_index(&key).await?;
        return Ok(false);
      }
      Ok(true)
    });

    match task.await {
      Ok(result) => result,
      Err(e) => Err(CacheError::StoreUnavailable(format!(
        "index prune task failed: {}",
        e
      ))),
    }
  }
}
