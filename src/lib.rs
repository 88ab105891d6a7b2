//! Shared segment cache coordination over a key/value store.
//!
//! Segments are stored under their encoded header, every encoded header is
//! tracked in one shared index set, and each process turns store changes
//! into created/deleted events for its registered listeners.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod expiry;
pub mod feed;
pub mod listeners;
pub mod pump;
pub mod store;
pub mod sync;
pub mod view;

pub use cache::{SegmentCache, SegmentCacheService};
pub use codec::{JsonCodec, SegmentCodec};
pub use config::{CacheConfig, CacheOptions};
pub use error::{CacheError, CacheResult};
pub use event::{EventType, SegmentCacheEvent, SegmentCacheListener};
pub use expiry::ExpiryPolicy;
pub use feed::FeedMode;
pub use listeners::SharedListener;
pub use store::{EntryStore, InMemoryEntryStore, RedisEntryStore};
pub use sync::{ReconcileOutcome, ReconcileReport};
