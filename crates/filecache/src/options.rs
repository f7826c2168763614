//! Expiration policy and wrapper configuration

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One second
pub const SECOND: Duration = Duration::from_secs(1);
/// One minute
pub const MINUTE: Duration = Duration::from_secs(60);
/// One hour
pub const HOUR: Duration = Duration::from_secs(60 * 60);
/// One day
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);
/// Seven days
pub const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Thirty days
pub const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// 365 days
pub const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// Entries never expire
pub const FOREVER: Validity = Validity::Forever;

/// How long a stored entry stays fresh
///
/// Serialized as `null` / `"forever"` for [`Validity::Forever`] and as a
/// number of seconds otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Validity {
    /// Entries never expire by time; they are only replaced by a new write
    #[default]
    Forever,
    /// Entries older than this are stale. Zero makes every entry stale.
    Within(Duration),
}

impl Validity {
    /// Validity measured in (possibly fractional) seconds
    ///
    /// Zero, negative and NaN values clamp to [`Duration::ZERO`], which
    /// disables cache reads. Values too large for a `Duration`, including
    /// infinity, mean [`Validity::Forever`].
    #[must_use]
    pub fn seconds(secs: f64) -> Self {
        if secs.is_nan() || secs <= 0.0 {
            return Self::Within(Duration::ZERO);
        }
        Duration::try_from_secs_f64(secs).map_or(Self::Forever, Self::Within)
    }

    /// Whether an entry written at `written_at` is still fresh at `now`
    ///
    /// A timestamp in the future (clock moved backwards) counts as fresh
    /// unless the validity is zero.
    #[must_use]
    pub fn is_fresh(&self, written_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Forever => true,
            Self::Within(window) if window.is_zero() => false,
            Self::Within(window) => match now.signed_duration_since(written_at).to_std() {
                Ok(age) => age < *window,
                Err(_) => true,
            },
        }
    }
}

impl From<Duration> for Validity {
    fn from(window: Duration) -> Self {
        Self::Within(window)
    }
}

impl Serialize for Validity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Forever => serializer.serialize_str("forever"),
            Self::Within(window) => serializer.serialize_f64(window.as_secs_f64()),
        }
    }
}

impl<'de> Deserialize<'de> for Validity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(f64),
            Keyword(String),
        }

        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(Self::Forever),
            Some(Repr::Seconds(secs)) => Ok(Self::seconds(secs)),
            Some(Repr::Keyword(word)) if word.eq_ignore_ascii_case("forever") => Ok(Self::Forever),
            Some(Repr::Keyword(word)) => Err(de::Error::invalid_value(
                de::Unexpected::Str(&word),
                &"a number of seconds, null, or \"forever\"",
            )),
        }
    }
}

/// Configuration for a memoized computation
///
/// Can be embedded in a host application's own configuration file:
///
/// ```rust,ignore
/// let opts: CacheOptions = serde_json::from_str(r#"{"validity": 3600, "fail_silently": true}"#)?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// How long entries stay fresh
    pub validity: Validity,
    /// Log and suppress cache failures instead of returning them
    pub fail_silently: bool,
    /// Flush the store to disk after every write
    pub force_sync: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            validity: Validity::Forever,
            fail_silently: false,
            force_sync: true,
        }
    }
}

impl CacheOptions {
    /// Default options: entries never expire, failures are returned
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with a finite validity window
    #[must_use]
    pub fn within(window: Duration) -> Self {
        Self::default().with_validity(window)
    }

    /// Set the validity
    #[must_use]
    pub fn with_validity(mut self, validity: impl Into<Validity>) -> Self {
        self.validity = validity.into();
        self
    }

    /// Set whether cache failures are suppressed
    #[must_use]
    pub fn with_fail_silently(mut self, fail_silently: bool) -> Self {
        self.fail_silently = fail_silently;
        self
    }

    /// Set whether every write is flushed to disk
    #[must_use]
    pub fn with_force_sync(mut self, force_sync: bool) -> Self {
        self.force_sync = force_sync;
        self
    }
}
