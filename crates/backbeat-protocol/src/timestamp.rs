//! Flexible timestamp handling for wire envelopes.
//!
//! Clients send timestamps as either Unix milliseconds (integer) or
//! RFC 3339 strings. The server always emits RFC 3339. The asymmetry
//! is intentional: accept what clients produce, emit one canonical form.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A point in time carried on the wire.
///
/// Wire precision is milliseconds; sub-millisecond detail does not
/// survive an encode/decode round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Build from Unix milliseconds. `None` if the value is outside
    /// the representable range.
    #[must_use]
    pub fn from_unix_ms(ms: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(ms).map(Self)
    }

    /// Unix milliseconds since the epoch.
    #[must_use]
    pub fn unix_ms(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Canonical wire form: RFC 3339, UTC, millisecond precision.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// The underlying instant.
    #[must_use]
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

/// Accepted wire forms.
#[derive(Deserialize)]
#[serde(untagged)]
enum TimestampRepr {
    UnixMs(i64),
    Rfc3339(String),
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = TimestampRepr::deserialize(deserializer).map_err(|_| {
            D::Error::custom("timestamp must be Unix milliseconds (integer) or an RFC 3339 string")
        })?;

        match repr {
            TimestampRepr::UnixMs(ms) => Self::from_unix_ms(ms)
                .ok_or_else(|| D::Error::custom(format!("timestamp {ms} is out of range"))),
            TimestampRepr::Rfc3339(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Self(dt.with_timezone(&Utc)))
                .map_err(|e| D::Error::custom(format!("invalid RFC 3339 timestamp: {e}"))),
        }
    }
}
