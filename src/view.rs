//! Local view of which encoded keys this process has observed as present
//!
//! Never authoritative: it only exists so each observed transition is
//! announced once. Reconciliation replaces it wholesale; key-event channels
//! update single keys.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Difference between two observations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDelta {
  /// Keys observed now but not before
  pub created: Vec<String>,
  /// Keys observed before but not now
  pub deleted: Vec<String>,
}

impl ViewDelta {
  pub fn is_empty(&self) -> bool {
    self.created.is_empty() && self.deleted.is_empty()
  }

  pub fn len(&self) -> usize {
    self.created.len() + self.deleted.len()
  }
}

#[derive(Default)]
pub struct LocalView {
  keys: RwLock<Arc<HashSet<String>>>,
}

impl LocalView {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.keys.read().contains(key)
  }

  pub fn len(&self) -> usize {
    self.keys.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.keys.read().is_empty()
  }

  /// Current observation. Cheap: shares the underlying set.
  pub fn snapshot(&self) -> Arc<HashSet<String>> {
    self.keys.read().clone()
  }

  /// Swap in a fresh observation and return what changed. Readers see
  /// either the old set or the new one, never a mix.
  pub fn replace(&self, observed: HashSet<String>) -> ViewDelta {
    let observed = Arc::new(observed);
    let previous = {
      let mut keys = self.keys.write();
      std::mem::replace(&mut *keys, observed.clone())
    };

    let mut created: Vec<String> = observed.difference(&previous).cloned().collect();
    let mut deleted: Vec<String> = previous.difference(&observed).cloned().collect();
    created.sort();
    deleted.sort();
    ViewDelta { created, deleted }
  }

  /// Fill the view without reporting anything
  pub fn prime(&self, keys: impl IntoIterator<Item = String>) {
    *self.keys.write() = Arc::new(keys.into_iter().collect());
  }

  /// Returns true if the key was not present before
  pub fn mark_present(&self, key: &str) -> bool {
    let mut keys = self.keys.write();
    if keys.contains(key) {
      return false;
    }
    Arc::make_mut(&mut keys).insert(key.to_string())
  }

  /// Returns true if the key was present before
  pub fn mark_absent(&self, key: &str) -> bool {
    let mut keys = self.keys.write();
    if !keys.contains(key) {
      return false;
    }
    Arc::make_mut(&mut keys).remove(key)
  }

  pub fn clear(&self) {
    *self.keys.write() = Arc::new(HashSet::new());
  }
}
