//! Decides when a credential should be renewed before it is used.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

/// Renew proactively when the access credential expires within this window.
pub const DEFAULT_RENEWAL_MARGIN_SECS: i64 = 60;

/// Sessions older than this are considered stale by the coarse check.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 55 * 60;

/// Expiry claim of a JWT-shaped credential, if one can be read.
///
/// Never fails: anything that is not a three-part token with a JSON payload
/// carrying a numeric `exp` yields `None`.
pub fn expiry_of(access: &str) -> Option<DateTime<Utc>> {
    let payload = access.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    Utc.timestamp_opt(secs, 0).single()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub renewal_margin: Duration,
    pub stale_after: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            renewal_margin: Duration::seconds(DEFAULT_RENEWAL_MARGIN_SECS),
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }
}

impl FreshnessPolicy {
    /// Windows beyond what `chrono` can represent are clamped to its maximum.
    pub fn new(renewal_margin_secs: u64, stale_after_secs: u64) -> Self {
        Self {
            renewal_margin: clamped_seconds(renewal_margin_secs),
            stale_after: clamped_seconds(stale_after_secs),
        }
    }

    /// True when the embedded expiry is closer than the renewal margin.
    /// A credential without a readable expiry never forces renewal.
    pub fn needs_renewal_soon(&self, access: &str, now: DateTime<Utc>) -> bool {
        match expiry_of(access) {
            Some(expiry) => expiry - now < self.renewal_margin,
            None => false,
        }
    }

    /// Coarse check on login age, independent of the token contents.
    pub fn is_stale(&self, login_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match login_time {
            Some(at) => now - at > self.stale_after,
            None => true,
        }
    }
}

/// Largest whole-second span a `chrono::Duration` holds.
const MAX_WINDOW_SECS: i64 = i64::MAX / 1_000;

fn clamped_seconds(secs: u64) -> Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_WINDOW_SECS);
    Duration::try_seconds(secs).unwrap_or_else(|| Duration::milliseconds(i64::MAX))
}
