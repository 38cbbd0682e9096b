//! Small helpers shared by every pipes crate.
//!
//! - [`Counter`]: atomic counter used for registration and client stats
//! - [`TintGenerator`]: per-instance correlation id source (`{name}-{pid}:{n}`)
//! - Human-readable durations (`"1m30s"`, `"500ms"`) and byte sizes (`"16M"`) for settings
//! - Millisecond timestamps, the unit auth cookies carry their expiry in
//!
//! ```
//! use pipes_utils::{to_bytesize, to_duration};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_bytesize("16M"), 16 * 1024 * 1024);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

mod counter;
mod tint;

pub use counter::Counter;
pub use tint::TintGenerator;

/// Milliseconds since the unix epoch.
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// A byte count configured as text, for example `"16M"` or `"1M512K"`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Bytesize(to_bytesize(&String::deserialize(deserializer)?)))
    }
}

/// Parses `G`, `M`, `K` and `B` suffixed sizes. Unparseable parts count as zero.
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            if u.is_ascii_digit() {
                return x.parse::<usize>().unwrap_or(0);
            }
            let v = match chars.as_str().parse::<usize>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

/// Converts `"1h30m"`-style text to a [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. A bare number is taken as seconds.
///
/// ```
/// assert_eq!(pipes_utils::to_duration("250ms").as_millis(), 250);
/// assert_eq!(pipes_utils::to_duration("1h30m15s").as_secs(), 5415);
/// assert_eq!(pipes_utils::to_duration("10").as_secs(), 10);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            if u.is_ascii_digit() {
                return x.parse::<u64>().map(|v| v * 1000).unwrap_or(0);
            }
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60_000,
                'h' => v * 3_600_000,
                'd' => v * 86_400_000,
                'w' => v * 604_800_000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    let d = to_duration(&v);
    if d.is_zero() && !v.trim().starts_with('0') {
        return Err(de::Error::custom(format!("invalid duration, {v}")));
    }
    Ok(d)
}

#[inline]
pub fn timestamp() -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    timestamp().as_millis() as TimestampMillis
}

/// Formats a millisecond timestamp the way HTTP `Expires` attributes expect it.
#[inline]
pub fn format_http_date(millis: TimestampMillis) -> String {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(t) => t.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        None => {
            log::warn!("timestamp out of range, {millis}");
            String::from("Thu, 01 Jan 1970 00:00:00 GMT")
        }
    }
}
