// crates/elspeth-core/src/core/time.rs
// ============================================================================
// Module: Timestamps
// Description: RFC 3339 timestamp wrapper used across audit records.
// Purpose: Give every audit record a serializable, comparable wall-clock stamp.
// Dependencies: time, serde
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A point in wall-clock time, serialized as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(#[serde(with = "rfc3339")] OffsetDateTime);

impl Timestamp {
    /// Wraps an existing [`OffsetDateTime`].
    #[must_use]
    pub const fn from_offset(value: OffsetDateTime) -> Self {
        Self(value)
    }

    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    /// Returns the wrapped [`OffsetDateTime`].
    #[must_use]
    pub const fn as_offset(&self) -> OffsetDateTime {
        self.0
    }

    /// Formats the timestamp as RFC 3339 text.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        // RFC 3339 formatting of a valid `OffsetDateTime` cannot fail.
        self.0
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
    }

    /// Parses an RFC 3339 string back into a timestamp. Used by recorder
    /// backends to rehydrate persisted records.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`time`] parse error if `text` is not valid
    /// RFC 3339.
    pub fn parse_rfc3339(text: &str) -> Result<Self, time::error::Parse> {
        OffsetDateTime::parse(text, &Rfc3339).map(Self)
    }

    /// Seconds since the Unix epoch, for retention-window arithmetic.
    #[must_use]
    pub const fn unix_seconds(&self) -> i64 {
        self.0.unix_timestamp()
    }
}

mod rfc3339 {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let text = value.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        OffsetDateTime::parse(&text, &Rfc3339).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let ts = Timestamp::from_offset(OffsetDateTime::UNIX_EPOCH);
        let json = serde_json::to_string(&ts).expect("serialize");
        let back: Timestamp = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(ts, back);
    }
}
