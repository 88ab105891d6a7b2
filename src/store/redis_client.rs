//! Redis entry store

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Value};
use std::collections::HashSet;

use super::{EntryStore, DEFAULT_INDEX_KEY};
use crate::config::RedisSection;
use crate::error::CacheResult;

const SCAN_BATCH: usize = 500;

/// Key-event classes needed by the push feed: keyevent channel (E), generic
/// commands (g), string commands (`$`), expired (x), evicted (e).
const KEY_EVENT_FLAGS: &str = "Eg$xe";

/// [`EntryStore`] backed by a Redis server.
///
/// Each operation checks out its own handle from the connection manager for
/// the duration of the call; the handle is released when the call returns,
/// whichever way it returns. Subscriptions use dedicated pub/sub connections.
pub struct RedisEntryStore {
  client: Client,
  connection: ConnectionManager,
  index_key: String,
  database: i64,
}

impl RedisEntryStore {
  /// Connect using the configured section
  pub async fn connect(config: &RedisSection, index_key: &str) -> CacheResult<Self> {
    let client = Client::open(config.connection_url())?;
    let connection = ConnectionManager::new(client.clone()).await?;

    tracing::debug!(url = %config.redacted_url(), "Redis entry store connected");

    Ok(Self {
      client,
      connection,
      index_key: index_key.to_string(),
      database: config.database as i64,
    })
  }

  /// Connect with default settings
  pub async fn connect_default() -> CacheResult<Self> {
    Self::connect(&RedisSection::default(), DEFAULT_INDEX_KEY).await
  }

  /// Test the connection to Redis
  pub async fn test_connection(&self) -> CacheResult<()> {
    let mut conn = self.connection.clone();
    redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }
}

/// Normalise the reply of a write: servers and client versions disagree on
/// whether success is `+OK`, a status string or a boolean.
fn is_success_reply(value: &Value) -> bool {
  match value {
    Value::Okay => true,
    Value::SimpleString(s) => s.eq_ignore_ascii_case("OK"),
    Value::BulkString(bytes) => bytes.eq_ignore_ascii_case(b"OK"),
    Value::Boolean(b) => *b,
    Value::Int(n) => *n > 0,
    _ => false,
  }
}

/// Index members that are not UTF-8 can never decode as a header
fn members_from_bytes(batch: Vec<Vec<u8>>) -> Vec<String> {
  batch
    .into_iter()
    .filter_map(|raw| match String::from_utf8(raw) {
      Ok(member) => Some(member),
      Err(e) => {
        tracing::debug!("Skipping non UTF-8 index member ({} bytes)", e.as_bytes().len());
        None
      }
    })
    .collect()
}

/// A blob that is not UTF-8 is reported as a miss
fn blob_from_bytes(key: &str, raw: Option<Vec<u8>>) -> Option<String> {
  match String::from_utf8(raw?) {
    Ok(blob) => Some(blob),
    Err(_) => {
      tracing::debug!(key = %key, "Treating non UTF-8 entry as absent");
      None
    }
  }
}

#[async_trait]
impl EntryStore for RedisEntryStore {
  fn index_key(&self) -> &str {
    &self.index_key
  }

  fn database(&self) -> i64 {
    self.database
  }

  async fn get(&self, key: &str) -> CacheResult<Option<String>> {
    let mut conn = self.connection.clone();
    let raw: Option<Vec<u8>> = conn.get(key).await?;
    Ok(blob_from_bytes(key, raw))
  }

  async fn set(&self, key: &str, blob: &str) -> CacheResult<bool> {
    let mut conn = self.connection.clone();
    let reply: Value = redis::cmd("SET")
      .arg(key)
      .arg(blob)
      .query_async(&mut conn)
      .await?;
    Ok(is_success_reply(&reply))
  }

  async fn set_with_expiry(&self, key: &str, blob: &str, ttl_secs: u64) -> CacheResult<bool> {
    let mut conn = self.connection.clone();
    let reply: Value = redis::cmd("SET")
      .arg(key)
      .arg(blob)
      .arg("EX")
      .arg(ttl_secs.max(1))
      .query_async(&mut conn)
      .await?;
    Ok(is_success_reply(&reply))
  }

  async fn delete(&self, key: &str) -> CacheResult<u64> {
    let mut conn = self.connection.clone();
    let deleted: u64 = conn.del(key).await?;
    Ok(deleted)
  }

  async fn exists(&self, key: &str) -> CacheResult<bool> {
    let mut conn = self.connection.clone();
    let exists: bool = conn.exists(key).await?;
    Ok(exists)
  }

  async fn add_to_index(&self, key: &str) -> CacheResult<bool> {
    let mut conn = self.connection.clone();
    let added: u64 = conn.sadd(&self.index_key, key).await?;
    Ok(added > 0)
  }

  async fn remove_from_index(&self, key: &str) -> CacheResult<bool> {
    let mut conn = self.connection.clone();
    let removed: u64 = conn.srem(&self.index_key, key).await?;
    Ok(removed > 0)
  }

  async fn scan_index(&self) -> CacheResult<Vec<String>> {
    let mut conn = self.connection.clone();
    let mut seen = HashSet::new();
    let mut members = Vec::new();
    let mut cursor: u64 = 0;

    // SSCAN may repeat members across batches
    loop {
      let (next_cursor, batch): (u64, Vec<Vec<u8>>) = redis::cmd("SSCAN")
        .arg(&self.index_key)
        .arg(cursor)
        .arg("COUNT")
        .arg(SCAN_BATCH)
        .query_async(&mut conn)
        .await?;

      for member in members_from_bytes(batch) {
        if seen.insert(member.clone()) {
          members.push(member);
        }
      }

      cursor = next_cursor;
      if cursor == 0 {
        break;
      }
    }

    Ok(members)
  }

  async fn publish(&self, channel: &str, message: &str) -> CacheResult<u64> {
    let mut conn = self.connection.clone();
    let receivers: u64 = conn.publish(channel, message).await?;
    Ok(receivers)
  }

  async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>> {
    let mut pubsub = self.client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;

    let messages = pubsub
      .into_on_message()
      .filter_map(|msg| futures_util::future::ready(msg.get_payload::<String>().ok()))
      .boxed();
    Ok(messages)
  }

  async fn enable_key_events(&self) -> CacheResult<()> {
    let mut conn = self.connection.clone();
    redis::cmd("CONFIG")
      .arg("SET")
      .arg("notify-keyspace-events")
      .arg(KEY_EVENT_FLAGS)
      .query_async::<()>(&mut conn)
      .await?;
    tracing::info!("Enabled Redis key-event notifications ({})", KEY_EVENT_FLAGS);
    Ok(())
  }
}
