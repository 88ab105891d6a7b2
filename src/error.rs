//! Error types

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the segment cache
#[derive(Debug, Error)]
pub enum CacheError {
  /// The shared store could not complete an operation. The state of the
  /// affected key is unknown, never "absent".
  #[error("Store unavailable: {0}")]
  StoreUnavailable(String),

  /// A bounded operation (reconciliation) ran past its deadline
  #[error("Operation timed out after {0:?}")]
  Timeout(Duration),

  /// Invalid configuration
  #[error("Invalid configuration: {0}")]
  Config(String),

  /// A value could not be encoded for storage
  #[error("Encoding error: {0}")]
  Codec(String),
}

impl CacheError {
  pub fn is_store_unavailable(&self) -> bool {
    matches!(self, CacheError::StoreUnavailable(_))
  }
}

impl From<redis::RedisError> for CacheError {
  fn from(e: redis::RedisError) -> Self {
    CacheError::StoreUnavailable(e.to_string())
  }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
