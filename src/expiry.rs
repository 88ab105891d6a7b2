//! Entry expiry policies
//!
//! Resolves the configured expiry strategy into a TTL (in seconds) at the
//! moment an entry is written. All arithmetic is done on local wall-clock
//! time, with `now` injectable for tests.

use chrono::{Duration, Local, NaiveDateTime, NaiveTime, Timelike};
use std::sync::Arc;

use crate::error::{CacheError, CacheResult};

/// Caller-supplied expiry computation. Receives the encoded key and returns
/// the TTL in seconds, or `None` for no expiry.
pub type ExpiryCallback = Arc<dyn Fn(&str) -> Option<u64> + Send + Sync>;

/// How long entries live once written
#[derive(Clone, Default)]
pub enum ExpiryPolicy {
  /// Entries never expire through this layer
  #[default]
  Never,
  /// Fixed TTL in seconds
  Ttl(u64),
  /// Expire at a wall-clock time each day
  DailyAt(NaiveTime),
  /// Expire ten minutes before the top of the next hour
  Hourly,
  /// Dynamic expiry
  Callback(ExpiryCallback),
}

impl std::fmt::Debug for ExpiryPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ExpiryPolicy::Never => write!(f, "Never"),
      ExpiryPolicy::Ttl(secs) => write!(f, "Ttl({})", secs),
      ExpiryPolicy::DailyAt(t) => write!(f, "DailyAt({})", t),
      ExpiryPolicy::Hourly => write!(f, "Hourly"),
      ExpiryPolicy::Callback(_) => write!(f, "Callback"),
    }
  }
}

const HOURLY_LEAD: i64 = 10 * 60;

impl ExpiryPolicy {
  /// Pick the single honored strategy from the configured ones.
  ///
  /// Precedence: `ttl_seconds`, then `expires_at`, then `expires_hourly`,
  /// then the callback. Anything past the first is ignored.
  pub fn resolve(
    ttl_seconds: Option<u64>,
    expires_at: Option<&str>,
    expires_hourly: bool,
    callback: Option<ExpiryCallback>,
  ) -> CacheResult<Self> {
    let mut candidates: Vec<ExpiryPolicy> = Vec::new();

    if let Some(secs) = ttl_seconds.filter(|s| *s > 0) {
      candidates.push(ExpiryPolicy::Ttl(secs));
    }
    if let Some(at) = expires_at.map(str::trim).filter(|s| !s.is_empty()) {
      candidates.push(ExpiryPolicy::DailyAt(parse_time_of_day(at)?));
    }
    if expires_hourly {
      candidates.push(ExpiryPolicy::Hourly);
    }
    if let Some(cb) = callback {
      candidates.push(ExpiryPolicy::Callback(cb));
    }

    if candidates.len() > 1 {
      tracing::warn!(
        "{} expiry strategies configured, honoring {:?}",
        candidates.len(),
        candidates[0]
      );
    }

    Ok(candidates.into_iter().next().unwrap_or_default())
  }

  pub fn is_never(&self) -> bool {
    matches!(self, ExpiryPolicy::Never)
  }

  /// TTL for an entry written now
  pub fn ttl_seconds(&self, key: &str) -> Option<u64> {
    self.ttl_seconds_at(Local::now().naive_local(), key)
  }

  /// TTL for an entry written at `now`. Never returns `Some(0)`.
  pub fn ttl_seconds_at(&self, now: NaiveDateTime, key: &str) -> Option<u64> {
    match self {
      ExpiryPolicy::Never => None,
      ExpiryPolicy::Ttl(secs) => Some(*secs).filter(|s| *s > 0),
      ExpiryPolicy::DailyAt(cutoff) => Some(seconds_until_daily(now, *cutoff)),
      ExpiryPolicy::Hourly => seconds_until_hourly(now),
      ExpiryPolicy::Callback(cb) => cb(key).filter(|s| *s > 0),
    }
  }
}

/// Parse "HH:MM" or "HH:MM:SS"
pub fn parse_time_of_day(s: &str) -> CacheResult<NaiveTime> {
  NaiveTime::parse_from_str(s, "%H:%M:%S")
    .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
    .map_err(|_| CacheError::Config(format!("invalid expires_at time: {}", s)))
}

fn whole_seconds(d: Duration) -> u64 {
  d.num_seconds().max(1) as u64
}

/// Seconds until the next occurrence of `cutoff`. A cutoff that is now or
/// already past today rolls to tomorrow.
fn seconds_until_daily(now: NaiveDateTime, cutoff: NaiveTime) -> u64 {
  let today = now.date().and_time(cutoff);
  let target = if today > now {
    today
  } else {
    today + Duration::days(1)
  };
  whole_seconds(target - now)
}

fn seconds_until_hourly(now: NaiveDateTime) -> Option<u64> {
  let hour_start = now.date().and_time(NaiveTime::from_hms_opt(now.hour(), 0, 0)?);
  let mut target = hour_start + Duration::hours(1) - Duration::seconds(HOURLY_LEAD);
  if target <= now {
    target += Duration::hours(1);
  }
  Some(whole_seconds(target - now))
}
