//! Cache configuration
//!
//! Loaded from YAML (with `$VAR` / `${VAR}` expansion) and resolved once
//! into the immutable [`CacheOptions`] a cache instance runs with.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::expiry::{ExpiryCallback, ExpiryPolicy};
use crate::feed::FeedMode;
use crate::store::DEFAULT_INDEX_KEY;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax. Substituted values are not
/// scanned again; an unterminated `${` is kept as written.
fn expand_env_vars(input: &str) -> String {
  let mut result = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    result.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      let Some(end) = braced.find('}') else {
        rest = &rest[pos..];
        break;
      };
      result.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
      rest = &braced[end + 1..];
      continue;
    }

    // Variable names are ASCII, so the byte count is a char boundary
    let var_len = after
      .bytes()
      .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
      .count();
    if var_len > 0 {
      result.push_str(&std::env::var(&after[..var_len]).unwrap_or_default());
    } else {
      result.push('$');
    }
    rest = &after[var_len..];
  }

  result.push_str(rest);
  result
}

/// Connection settings for the shared Redis store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSection {
  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_redis_port")]
  pub port: u16,

  #[serde(default)]
  pub password: Option<String>,

  /// Logical database; also selects the key-event channels
  #[serde(default)]
  pub database: u8,

  #[serde(default)]
  pub tls_enabled: bool,

  /// Issue `CONFIG SET notify-keyspace-events` on connect
  #[serde(default)]
  pub configure_key_events: bool,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_redis_port() -> u16 {
  6379
}

impl Default for RedisSection {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_redis_port(),
      password: None,
      database: 0,
      tls_enabled: false,
      configure_key_events: false,
    }
  }
}

impl RedisSection {
  /// Generate Redis connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }

  /// Connection URL with the password masked, for logs
  pub fn redacted_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => ":***@",
      _ => "",
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }
}

/// Expiry strategy. At most one is honored (see [`ExpiryPolicy::resolve`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpirySection {
  #[serde(default)]
  pub ttl_seconds: Option<u64>,

  /// Daily cutoff, "HH:MM" or "HH:MM:SS" local time
  #[serde(default)]
  pub expires_at: Option<String>,

  #[serde(default)]
  pub expires_hourly: bool,
}

/// Change feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSection {
  #[serde(default)]
  pub mode: FeedMode,

  #[serde(default = "default_reconcile_interval")]
  pub reconcile_interval_secs: u64,

  #[serde(default = "default_reconcile_timeout")]
  pub reconcile_timeout_secs: u64,

  #[serde(default = "default_resubscribe_backoff")]
  pub resubscribe_backoff_ms: u64,
}

fn default_reconcile_interval() -> u64 {
  360
}

fn default_reconcile_timeout() -> u64 {
  45
}

fn default_resubscribe_backoff() -> u64 {
  1000
}

impl Default for FeedSection {
  fn default() -> Self {
    Self {
      mode: FeedMode::default(),
      reconcile_interval_secs: default_reconcile_interval(),
      reconcile_timeout_secs: default_reconcile_timeout(),
      resubscribe_backoff_ms: default_resubscribe_backoff(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}

fn default_level() -> String {
  "info".into()
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub redis: RedisSection,

  #[serde(default = "default_index_key")]
  pub index_key: String,

  #[serde(default)]
  pub expiry: ExpirySection,

  #[serde(default)]
  pub feed: FeedSection,

  /// Remove every indexed entry and the index itself on tear down
  #[serde(default)]
  pub delete_all_on_teardown: bool,

  /// Replay existing entries to newly added listeners
  #[serde(default = "default_true")]
  pub eager_load: bool,

  #[serde(default)]
  pub logging: LoggingSection,
}

fn default_index_key() -> String {
  DEFAULT_INDEX_KEY.to_string()
}

fn default_true() -> bool {
  true
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      redis: RedisSection::default(),
      index_key: default_index_key(),
      expiry: ExpirySection::default(),
      feed: FeedSection::default(),
      delete_all_on_teardown: false,
      eager_load: true,
      logging: LoggingSection::default(),
    }
  }
}

impl CacheConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    let expanded = expand_env_vars(&content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["segment-cache.yaml", "segment-cache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  /// Resolve into runtime options
  pub fn options(&self) -> CacheResult<CacheOptions> {
    self.options_with_callback(None)
  }

  /// Resolve into runtime options, with a programmatic expiry callback
  pub fn options_with_callback(
    &self,
    callback: Option<ExpiryCallback>,
  ) -> CacheResult<CacheOptions> {
    if self.index_key.trim().is_empty() {
      return Err(CacheError::Config("index_key must not be empty".to_string()));
    }
    if self.feed.reconcile_interval_secs == 0 {
      return Err(CacheError::Config(
        "feed.reconcile_interval_secs must be positive".to_string(),
      ));
    }
    if self.feed.reconcile_timeout_secs == 0 {
      return Err(CacheError::Config(
        "feed.reconcile_timeout_secs must be positive".to_string(),
      ));
    }

    let expiry = ExpiryPolicy::resolve(
      self.expiry.ttl_seconds,
      self.expiry.expires_at.as_deref(),
      self.expiry.expires_hourly,
      callback,
    )?;

    Ok(CacheOptions {
      expiry,
      feed_mode: self.feed.mode,
      reconcile_interval: Duration::from_secs(self.feed.reconcile_interval_secs),
      reconcile_timeout: Duration::from_secs(self.feed.reconcile_timeout_secs),
      resubscribe_backoff: Duration::from_millis(self.feed.resubscribe_backoff_ms),
      delete_all_on_teardown: self.delete_all_on_teardown,
      eager_load: self.eager_load,
      enable_key_events: self.redis.configure_key_events,
    })
  }
}

/// Immutable runtime options of a cache instance
#[derive(Debug, Clone)]
pub struct CacheOptions {
  pub expiry: ExpiryPolicy,
  pub feed_mode: FeedMode,
  pub reconcile_interval: Duration,
  pub reconcile_timeout: Duration,
  pub resubscribe_backoff: Duration,
  pub delete_all_on_teardown: bool,
  pub eager_load: bool,
  pub enable_key_events: bool,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      expiry: ExpiryPolicy::Never,
      feed_mode: FeedMode::default(),
      reconcile_interval: Duration::from_secs(default_reconcile_interval()),
      reconcile_timeout: Duration::from_secs(default_reconcile_timeout()),
      resubscribe_backoff: Duration::from_millis(default_resubscribe_backoff()),
      delete_all_on_teardown: false,
      eager_load: true,
      enable_key_events: false,
    }
  }
}

impl CacheOptions {
  pub fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
    self.expiry = expiry;
    self
  }

  pub fn with_feed_mode(mut self, mode: FeedMode) -> Self {
    self.feed_mode = mode;
    self
  }

  pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
    self.reconcile_interval = interval;
    self
  }

  pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
    self.reconcile_timeout = timeout;
    self
  }

  pub fn with_resubscribe_backoff(mut self, backoff: Duration) -> Self {
    self.resubscribe_backoff = backoff;
    self
  }

  pub fn with_delete_all_on_teardown(mut self, enabled: bool) -> Self {
    self.delete_all_on_teardown = enabled;
    self
  }

  pub fn with_eager_load(mut self, enabled: bool) -> Self {
    self.eager_load = enabled;
    self
  }
}
