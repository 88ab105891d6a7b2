//! Segment cache facade
//!
//! Ties the store, codec, local view, listener registry and change feed
//! together behind the fixed operation set a host engine calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::SegmentCodec;
use crate::config::CacheOptions;
use crate::error::CacheResult;
use crate::event::EventType;
use crate::feed::{build_feed, FeedMode, FeedTiming};
use crate::listeners::{Dispatcher, ListenerRegistry, SharedListener};
use crate::pump::EventPump;
use crate::store::EntryStore;
use crate::sync::{IndexSynchronizer, ReconcileOutcome};
use crate::view::LocalView;

/// How long tear down waits for background tasks before aborting them
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Operations a host engine uses to share segments through the cache
#[async_trait]
pub trait SegmentCacheService<H, B>: Send + Sync {
  async fn get(&self, header: &H) -> CacheResult<Option<B>>;

  /// Returns whether the store acknowledged the write
  async fn put(&self, header: &H, body: &B) -> CacheResult<bool>;

  /// Returns whether an entry was actually deleted
  async fn remove(&self, header: &H) -> CacheResult<bool>;

  async fn contains(&self, header: &H) -> CacheResult<bool>;

  /// Every indexed header that still decodes
  async fn get_segment_headers(&self) -> CacheResult<Vec<H>>;

  async fn add_listener(&self, listener: SharedListener<H>) -> CacheResult<()>;

  fn remove_listener(&self, listener: &SharedListener<H>) -> bool;

  async fn tear_down(&self) -> CacheResult<()>;

  fn supports_rich_index(&self) -> bool;
}

pub struct SegmentCache<C: SegmentCodec> {
  store: Arc<dyn EntryStore>,
  codec: Arc<C>,
  options: CacheOptions,
  view: Arc<LocalView>,
  dispatcher: Dispatcher<C>,
  synchronizer: Arc<IndexSynchronizer>,
  pump: Arc<EventPump<C>>,
  shutdown_tx: watch::Sender<bool>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  torn_down: AtomicBool,
}

impl<C: SegmentCodec> SegmentCache<C> {
  /// Build a cache without starting its change feed. Storage operations
  /// and [`reconcile_now`](Self::reconcile_now) work; nothing is observed
  /// in the background.
  pub fn new_detached(store: Arc<dyn EntryStore>, codec: C, options: CacheOptions) -> Self {
    let codec = Arc::new(codec);
    let view = Arc::new(LocalView::new());
    let registry = Arc::new(ListenerRegistry::new());
    let dispatcher = Dispatcher::new(codec.clone(), registry);
    let synchronizer = Arc::new(IndexSynchronizer::new(store.clone(), view.clone()));
    let pump = Arc::new(EventPump::new(
      store.clone(),
      view.clone(),
      dispatcher.clone(),
    ));
    let (shutdown_tx, _) = watch::channel(false);

    Self {
      store,
      codec,
      options,
      view,
      dispatcher,
      synchronizer,
      pump,
      shutdown_tx,
      tasks: Mutex::new(Vec::new()),
      torn_down: AtomicBool::new(false),
    }
  }

  /// Build a cache, take a silent baseline of the index and start the
  /// change feed selected by `options.feed_mode`.
  pub async fn start(
    store: Arc<dyn EntryStore>,
    codec: C,
    options: CacheOptions,
  ) -> CacheResult<Arc<Self>> {
    let cache = Self::new_detached(store, codec, options);

    if cache.options.enable_key_events && cache.options.feed_mode != FeedMode::Pull {
      if let Err(e) = cache.store.enable_key_events().await {
        tracing::warn!("Failed to enable key-event notifications: {}", e);
      }
    }

    match cache.synchronizer.reconcile().await {
      Ok(ReconcileOutcome::Completed(report)) => {
        tracing::info!("Segment cache primed with {} entries", report.present);
      }
      Ok(ReconcileOutcome::Skipped) => {}
      Err(e) => {
        tracing::warn!("Could not prime segment cache, starting empty: {}", e);
      }
    }

    let feed = build_feed(
      cache.options.feed_mode,
      cache.store.clone(),
      cache.synchronizer.clone(),
      FeedTiming {
        reconcile_interval: cache.options.reconcile_interval,
        reconcile_timeout: cache.options.reconcile_timeout,
        resubscribe_backoff: cache.options.resubscribe_backoff,
      },
    );
    tracing::info!(
      "Starting {} change feed ({} mode)",
      feed.name(),
      cache.options.feed_mode
    );

    let transitions = feed.observe(cache.shutdown_tx.subscribe());
    let pump = cache.pump.clone();
    cache
      .tasks
      .lock()
      .push(tokio::spawn(async move { pump.run(transitions).await }));

    Ok(Arc::new(cache))
  }

  pub fn options(&self) -> &CacheOptions {
    &self.options
  }

  pub fn store(&self) -> &Arc<dyn EntryStore> {
    &self.store
  }

  /// Keys this process currently believes are present
  pub fn observed_len(&self) -> usize {
    self.view.len()
  }

  /// Headers can be enumerated through the shared index
  pub fn supports_rich_index(&self) -> bool {
    true
  }

  pub fn listener_count(&self) -> usize {
    self.dispatcher.registry().len()
  }

  pub fn is_torn_down(&self) -> bool {
    self.torn_down.load(Ordering::SeqCst)
  }

  pub async fn get(&self, header: &C::Header) -> CacheResult<Option<C::Body>> {
    let key = self.codec.encode_header(header)?;
    let Some(blob) = self.store.get(&key).await? else {
      return Ok(None);
    };
    match self.codec.decode_body(&blob) {
      Some(body) => Ok(Some(body)),
      None => {
        tracing::debug!("Treating undecodable body as a miss");
        Ok(None)
      }
    }
  }

  /// Index first, then entry. A crash in between leaves an index member
  /// without an entry, which the next reconciliation prunes.
  pub async fn put(&self, header: &C::Header, body: &C::Body) -> CacheResult<bool> {
    let key = self.codec.encode_header(header)?;
    let blob = self.codec.encode_body(body)?;

    self.store.add_to_index(&key).await?;
    match self.options.expiry.ttl_seconds(&key) {
      Some(ttl) => self.store.set_with_expiry(&key, &blob, ttl).await,
      None => self.store.set(&key, &blob).await,
    }
  }

  pub async fn remove(&self, header: &C::Header) -> CacheResult<bool> {
    let key = self.codec.encode_header(header)?;
    self.store.remove_from_index(&key).await?;
    Ok(self.store.delete(&key).await? > 0)
  }

  pub async fn contains(&self, header: &C::Header) -> CacheResult<bool> {
    let key = self.codec.encode_header(header)?;
    self.store.exists(&key).await
  }

  pub async fn get_segment_headers(&self) -> CacheResult<Vec<C::Header>> {
    let keys = self.store.scan_index().await?;
    Ok(
      keys
        .iter()
        .filter_map(|key| self.codec.decode_header(key))
        .collect(),
    )
  }

  /// Register a listener. With eager load enabled, a newly registered
  /// listener is then sent a created event for every indexed entry; no
  /// other listener sees that replay.
  pub async fn add_listener(&self, listener: SharedListener<C::Header>) -> CacheResult<()> {
    if !self.dispatcher.registry().add(listener.clone()) {
      return Ok(());
    }
    if !self.options.eager_load {
      return Ok(());
    }

    let keys = self.store.scan_index().await?;
    let mut replayed = 0;
    for header in keys.iter().filter_map(|key| self.codec.decode_header(key)) {
      self
        .dispatcher
        .deliver_to(&listener, EventType::Created, header);
      replayed += 1;
    }
    tracing::debug!("Replayed {} entries to new listener", replayed);
    Ok(())
  }

  pub fn remove_listener(&self, listener: &SharedListener<C::Header>) -> bool {
    self.dispatcher.registry().remove(listener)
  }

  /// Run a reconciliation pass now and dispatch its delta
  pub async fn reconcile_now(&self) -> CacheResult<ReconcileOutcome> {
    let outcome = self
      .synchronizer
      .reconcile_with_timeout(self.options.reconcile_timeout)
      .await?;
    if let ReconcileOutcome::Completed(report) = &outcome {
      for transition in report.transitions() {
        self.pump.apply(transition).await;
      }
    }
    Ok(outcome)
  }

  /// Stop the change feed and, if configured, delete every indexed entry
  /// and the index. Safe to call more than once.
  pub async fn tear_down(&self) -> CacheResult<()> {
    if !self.torn_down.swap(true, Ordering::SeqCst) {
      let _ = self.shutdown_tx.send(true);
      self.stop_tasks().await;
      self.view.clear();
      tracing::info!("Segment cache shut down");
    }

    if self.options.delete_all_on_teardown {
      self.purge().await?;
    }
    Ok(())
  }

  /// Delete every indexed entry, then the index. Returns the number of
  /// entries deleted.
  pub async fn purge(&self) -> CacheResult<u64> {
    let keys = self.store.scan_index().await?;
    let mut deleted = 0;
    for key in &keys {
      deleted += self.store.delete(key).await?;
    }
    let index_key = self.store.index_key().to_string();
    self.store.delete(&index_key).await?;
    tracing::info!("Purged {} of {} indexed entries", deleted, keys.len());
    Ok(deleted)
  }

  async fn stop_tasks(&self) {
    let handles = std::mem::take(&mut *self.tasks.lock());
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    let joined = tokio::time::timeout(
      TEARDOWN_GRACE,
      futures_util::future::join_all(handles),
    )
    .await;
    if joined.is_err() {
      tracing::warn!("Background tasks did not stop within {:?}, aborting", TEARDOWN_GRACE);
      for abort in aborts {
        abort.abort();
      }
    }
  }
}

#[async_trait]
impl<C: SegmentCodec> SegmentCacheService<C::Header, C::Body> for SegmentCache<C> {
  async fn get(&self, header: &C::Header) -> CacheResult<Option<C::Body>> {
    SegmentCache::get(self, header).await
  }

  async fn put(&self, header: &C::Header, body: &C::Body) -> CacheResult<bool> {
    SegmentCache::put(self, header, body).await
  }

  async fn remove(&self, header: &C::Header) -> CacheResult<bool> {
    SegmentCache::remove(self, header).await
  }

  async fn contains(&self, header: &C::Header) -> CacheResult<bool> {
    SegmentCache::contains(self, header).await
  }

  async fn get_segment_headers(&self) -> CacheResult<Vec<C::Header>> {
    SegmentCache::get_segment_headers(self).await
  }

  async fn add_listener(&self, listener: SharedListener<C::Header>) -> CacheResult<()> {
    SegmentCache::add_listener(self, listener).await
  }

  fn remove_listener(&self, listener: &SharedListener<C::Header>) -> bool {
    SegmentCache::remove_listener(self, listener)
  }

  async fn tear_down(&self) -> CacheResult<()> {
    SegmentCache::tear_down(self).await
  }

  fn supports_rich_index(&self) -> bool {
    SegmentCache::supports_rich_index(self)
  }
}
