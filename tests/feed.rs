//! Change feed and reconciliation tests

mod common;

use common::{encoded, eventually, header, subscribed, Codec, Recorder, SlowStore};
use segment_cache::feed::{ChangeFeed, KeyEventFeed, TransitionKind, TransitionSource};
use segment_cache::store::key_event_channel;
use segment_cache::{
  CacheError, CacheOptions, EntryStore, FeedMode, InMemoryEntryStore, ReconcileOutcome,
  SegmentCache,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn started(
  store: Arc<InMemoryEntryStore>,
  options: CacheOptions,
) -> (Arc<SegmentCache<Codec>>, Arc<Recorder>) {
  let cache = SegmentCache::start(store, Codec::new(), options)
    .await
    .unwrap();
  let recorder = Arc::new(Recorder::default());
  cache.add_listener(recorder.clone()).await.unwrap();
  (cache, recorder)
}

fn push_options() -> CacheOptions {
  CacheOptions::default()
    .with_feed_mode(FeedMode::Push)
    .with_resubscribe_backoff(Duration::from_millis(20))
}

// =============================================================================
// Key-Event Feed Tests
// =============================================================================

#[tokio::test]
async fn test_key_event_feed_emits_transitions() {
  let store = Arc::new(InMemoryEntryStore::new());
  let feed = Arc::new(KeyEventFeed::new(store.clone(), Duration::from_millis(20)));
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let mut transitions = feed.observe(shutdown_rx);
  assert!(subscribed(&store, 1).await);

  store.set("k1", "v").await.unwrap();
  let created = transitions.next().await.unwrap();
  assert_eq!(created.key, "k1");
  assert_eq!(created.kind, TransitionKind::Created);
  assert_eq!(created.source, TransitionSource::Channel);

  store.delete("k1").await.unwrap();
  assert_eq!(transitions.next().await.unwrap().kind, TransitionKind::Deleted);

  shutdown_tx.send(true).unwrap();
  assert!(transitions.next().await.is_none());
}

#[tokio::test]
async fn test_expired_entry_is_announced_and_unindexed() {
  let store = Arc::new(InMemoryEntryStore::new());
  let (cache, recorder) = started(store.clone(), push_options()).await;
  assert!(subscribed(&store, 1).await);

  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();
  assert!(eventually(|| recorder.created(&h) == 1).await);

  store.expire_now(&encoded(&h));
  assert!(eventually(|| recorder.deleted(&h) == 1).await);
  assert!(store.scan_index().await.unwrap().is_empty());

  cache.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_evicted_entry_is_reported_as_deleted() {
  let store = Arc::new(InMemoryEntryStore::new());
  let (cache, recorder) = started(store.clone(), push_options()).await;
  assert!(subscribed(&store, 1).await);

  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();
  assert!(eventually(|| recorder.created(&h) == 1).await);

  store.evict(&encoded(&h));
  assert!(eventually(|| recorder.deleted(&h) == 1).await);

  cache.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_foreign_keys_are_ignored() {
  let store = Arc::new(InMemoryEntryStore::new());
  let (cache, recorder) = started(store.clone(), push_options()).await;
  assert!(subscribed(&store, 1).await);

  store.set("session:1234", "unrelated").await.unwrap();
  store.delete("session:1234").await.unwrap();
  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();

  assert!(eventually(|| recorder.created(&h) == 1).await);
  assert_eq!(recorder.len(), 1);
  assert_eq!(cache.observed_len(), 1);

  cache.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_dropped_channel_is_resubscribed() {
  let store = Arc::new(InMemoryEntryStore::new());
  let (cache, recorder) = started(store.clone(), push_options()).await;
  assert!(subscribed(&store, 1).await);

  let set_channel = key_event_channel(0, "set");
  store.disconnect_channel(&set_channel);
  assert!(eventually(|| store.subscriber_count(&set_channel) == 1).await);
  // The other channels were never touched
  assert_eq!(store.subscriber_count(&key_event_channel(0, "del")), 1);

  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();
  assert!(eventually(|| recorder.created(&h) == 1).await);

  cache.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_feed_recovers_after_store_outage() {
  let store = Arc::new(InMemoryEntryStore::new());
  let (cache, recorder) = started(store.clone(), push_options()).await;
  assert!(subscribed(&store, 1).await);

  store.set_available(false);
  tokio::time::sleep(Duration::from_millis(60)).await;
  store.set_available(true);
  assert!(subscribed(&store, 1).await);

  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();
  assert!(eventually(|| recorder.created(&h) == 1).await);

  cache.tear_down().await.unwrap();
}

// =============================================================================
// Reconciliation Tests
// =============================================================================

#[tokio::test]
async fn test_reconcile_heals_index_and_notifies_once() {
  let store = Arc::new(InMemoryEntryStore::new());
  let cache = SegmentCache::new_detached(store.clone(), Codec::new(), CacheOptions::default());
  let recorder = Arc::new(Recorder::default());
  cache.add_listener(recorder.clone()).await.unwrap();

  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();
  cache.reconcile_now().await.unwrap();
  assert_eq!(recorder.created(&h), 1);

  // Entry vanishes behind the cache's back, index still lists it
  store.delete(&encoded(&h)).await.unwrap();
  assert_eq!(store.scan_index().await.unwrap(), vec![encoded(&h)]);

  match cache.reconcile_now().await.unwrap() {
    ReconcileOutcome::Completed(report) => assert_eq!(report.pruned, 1),
    ReconcileOutcome::Skipped => panic!("reconciliation was skipped"),
  }
  assert_eq!(recorder.deleted(&h), 1);
  assert!(store.scan_index().await.unwrap().is_empty());

  cache.reconcile_now().await.unwrap();
  assert_eq!(recorder.deleted(&h), 1);
}

#[tokio::test]
async fn test_reconcile_reports_every_transition_once() {
  let store = Arc::new(InMemoryEntryStore::new());
  let cache = SegmentCache::new_detached(store.clone(), Codec::new(), CacheOptions::default());
  let recorder = Arc::new(Recorder::default());
  cache.add_listener(recorder.clone()).await.unwrap();

  let a = header("Unit Sales");
  let b = header("Store Cost");
  let c = header("Store Sales");

  cache.put(&a, &vec![1.0]).await.unwrap();
  cache.put(&b, &vec![2.0]).await.unwrap();
  cache.reconcile_now().await.unwrap();

  cache.remove(&a).await.unwrap();
  cache.put(&c, &vec![3.0]).await.unwrap();
  cache.reconcile_now().await.unwrap();

  cache.remove(&b).await.unwrap();
  cache.remove(&c).await.unwrap();
  cache.reconcile_now().await.unwrap();
  cache.reconcile_now().await.unwrap();

  for h in [&a, &b, &c] {
    assert_eq!(recorder.created(h), 1, "created {:?}", h);
    assert_eq!(recorder.deleted(h), 1, "deleted {:?}", h);
  }
  assert_eq!(recorder.len(), 6);
}

#[tokio::test]
async fn test_pull_mode_observes_external_changes() {
  let store = Arc::new(InMemoryEntryStore::new());
  let options = CacheOptions::default()
    .with_feed_mode(FeedMode::Pull)
    .with_reconcile_interval(Duration::from_millis(30));
  let (cache, recorder) = started(store.clone(), options).await;

  // Another process writes
  let other = SegmentCache::new_detached(store.clone(), Codec::new(), CacheOptions::default());
  let h = header("Unit Sales");
  other.put(&h, &vec![1.0]).await.unwrap();
  assert!(eventually(|| recorder.created(&h) == 1).await);

  store.expire_now(&encoded(&h));
  assert!(eventually(|| recorder.deleted(&h) == 1).await);
  assert!(store.scan_index().await.unwrap().is_empty());

  cache.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_hybrid_mode_does_not_duplicate_events() {
  let store = Arc::new(InMemoryEntryStore::new());
  let options = CacheOptions::default()
    .with_feed_mode(FeedMode::Hybrid)
    .with_reconcile_interval(Duration::from_millis(30));
  let (cache, recorder) = started(store.clone(), options).await;
  assert!(subscribed(&store, 1).await);

  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();
  assert!(eventually(|| recorder.created(&h) == 1).await);

  // Several reconciliation ticks later nothing new is announced
  tokio::time::sleep(Duration::from_millis(120)).await;
  cache.reconcile_now().await.unwrap();
  assert_eq!(recorder.created(&h), 1);

  cache.remove(&h).await.unwrap();
  assert!(eventually(|| recorder.deleted(&h) == 1).await);
  tokio::time::sleep(Duration::from_millis(120)).await;
  assert_eq!(recorder.deleted(&h), 1);

  cache.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_hybrid_mode_covers_missing_key_events() {
  let store = Arc::new(InMemoryEntryStore::new());
  store.set_notify_key_events(false);
  let options = CacheOptions::default()
    .with_feed_mode(FeedMode::Hybrid)
    .with_reconcile_interval(Duration::from_millis(30));
  let (cache, recorder) = started(store.clone(), options).await;

  let h = header("Unit Sales");
  cache.put(&h, &vec![1.0]).await.unwrap();
  assert!(eventually(|| recorder.created(&h) == 1).await);

  cache.remove(&h).await.unwrap();
  assert!(eventually(|| recorder.deleted(&h) == 1).await);

  cache.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_reconciliations_are_skipped() {
  let inner = Arc::new(InMemoryEntryStore::new());
  let store = Arc::new(SlowStore::new(inner, Duration::from_millis(200)));
  let cache = Arc::new(SegmentCache::new_detached(
    store,
    Codec::new(),
    CacheOptions::default(),
  ));

  let running = cache.clone();
  let first = tokio::spawn(async move { running.reconcile_now().await });
  tokio::time::sleep(Duration::from_millis(50)).await;

  assert_eq!(cache.reconcile_now().await.unwrap(), ReconcileOutcome::Skipped);
  assert!(matches!(
    first.await.unwrap().unwrap(),
    ReconcileOutcome::Completed(_)
  ));
}

#[tokio::test]
async fn test_reconcile_times_out() {
  let inner = Arc::new(InMemoryEntryStore::new());
  let store = Arc::new(SlowStore::new(inner, Duration::from_millis(500)));
  let options = CacheOptions::default().with_reconcile_timeout(Duration::from_millis(50));
  let cache = SegmentCache::new_detached(store, Codec::new(), options);

  match cache.reconcile_now().await {
    Err(CacheError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(50)),
    other => panic!("expected timeout, got {:?}", other),
  }
}
