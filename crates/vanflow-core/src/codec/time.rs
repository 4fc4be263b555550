//! Record timestamps.
//!
//! On the wire a [`Time`] is the number of microseconds since the UNIX epoch
//! carried as a `uint64` value. An unset time is omitted from the attribute
//! set entirely.

use crate::codec::error::AttributeError;
use crate::codec::value::{Attribute, Value};
use chrono::{DateTime, Utc};
use std::fmt;

/// A point in time attached to a record, possibly unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(Option<DateTime<Utc>>);

impl Time {
    /// The unset time.
    pub const UNSET: Self = Self(None);

    /// Wrap a wall-clock instant.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Some(at))
    }

    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Some(Utc::now()))
    }

    /// Build a time from microseconds since the UNIX epoch.
    #[must_use]
    pub fn from_unix_micros(micros: i64) -> Self {
        Self(DateTime::from_timestamp_micros(micros))
    }

    /// The wrapped instant, if set.
    #[must_use]
    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// Whether this time holds a value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

impl From<DateTime<Utc>> for Time {
    fn from(at: DateTime<Utc>) -> Self {
        Self::new(at)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(at) => write!(f, "{}", at.to_rfc3339()),
            None => f.write_str("unset"),
        }
    }
}

impl Attribute for Time {
    fn encode_attribute(&self) -> Result<Value, AttributeError> {
        let Some(at) = self.0 else {
            return Err(AttributeError::NotSet);
        };
        let micros = u64::try_from(at.timestamp_micros()).map_err(|_| AttributeError::BeforeEpoch)?;
        Ok(Value::Uint64(micros))
    }

    fn decode_attribute(value: &Value) -> Result<Self, AttributeError> {
        let micros = match value {
            Value::Uint64(micros) => *micros,
            other => {
                return Err(AttributeError::UnexpectedType {
                    expected: "uint64",
                    actual: other.kind(),
                })
            }
        };
        let signed = i64::try_from(micros).map_err(|_| AttributeError::TooFarInFuture(micros))?;
        DateTime::from_timestamp_micros(signed)
            .map(Self::new)
            .ok_or(AttributeError::TooFarInFuture(micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encodes_micros_since_epoch() {
        let t = Time::from_unix_micros(1_704_067_200_000_123);
        assert_eq!(
            t.encode_attribute().unwrap(),
            Value::Uint64(1_704_067_200_000_123)
        );
        assert_eq!(Time::decode_attribute(&Value::Uint64(1_704_067_200_000_123)).unwrap(), t);
    }

    #[test]
    fn unset_time_is_not_set() {
        assert!(matches!(
            Time::UNSET.encode_attribute(),
            Err(AttributeError::NotSet)
        ));
        assert!(!Time::default().is_set());
    }

    #[test]
    fn epoch_encodes_as_zero() {
        let epoch = Time::new(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(epoch.encode_attribute().unwrap(), Value::Uint64(0));
    }

    #[test]
    fn time_before_epoch_fails() {
        let before = Time::new(Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap());
        assert_eq!(
            before.encode_attribute().unwrap_err(),
            AttributeError::BeforeEpoch
        );
    }

    #[test]
    fn decode_beyond_i64_fails() {
        let too_far = u64::try_from(i64::MAX).unwrap() + 1;
        let err = Time::decode_attribute(&Value::Uint64(too_far)).unwrap_err();
        assert_eq!(err, AttributeError::TooFarInFuture(too_far));
        assert!(err.to_string().contains("too far in future"));
    }

    #[test]
    fn decode_rejects_wrong_type() {
        assert!(matches!(
            Time::decode_attribute(&Value::Int64(5)),
            Err(AttributeError::UnexpectedType { expected: "uint64", .. })
        ));
    }
}
