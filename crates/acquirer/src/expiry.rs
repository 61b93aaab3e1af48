//! Session expiry detection
//!
//! The upstream site stores a JWT in one of its cookies; its `exp` claim is
//! the session lifetime. When that cookie is absent or undecodable the
//! session is assumed to last until a fixed local time of day.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use tracing::debug;

/// Read the `exp` claim (seconds since epoch) from a JWT without verifying it.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let payload = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .ok()?;

    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(secs, 0)
}

/// Next instant strictly after `now` whose local time of day is `at`.
///
/// Today at `at` if that is still ahead, otherwise tomorrow. A local time that
/// falls into a DST gap resolves to the following day.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Utc> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest() {
            if candidate > *now {
                return candidate.with_timezone(&Utc);
            }
        }
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }
    now.with_timezone(&Utc) + chrono::Duration::days(1)
}

/// Expiry for a freshly acquired cookie set.
pub fn resolve_expiry<Tz: TimeZone>(
    cookies: &HashMap<String, String>,
    expiry_cookie: &str,
    fallback: NaiveTime,
    now: &DateTime<Tz>,
) -> DateTime<Utc> {
    if let Some(at) = cookies.get(expiry_cookie).and_then(|v| jwt_expiry(v)) {
        debug!(cookie = expiry_cookie, expires_at = %at, "session expiry from JWT claim");
        return at;
    }
    let at = next_occurrence(now, fallback);
    debug!(cookie = expiry_cookie, expires_at = %at, "no JWT expiry, using fallback time");
    at
}
