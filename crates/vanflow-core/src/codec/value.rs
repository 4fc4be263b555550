//! Primitive attribute values and the [`Attribute`] contract.

use crate::codec::error::AttributeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric key identifying a record type or a record attribute on the wire.
pub type Codepoint = u32;

/// Reserved codepoint holding the record type of an attribute set.
pub const TYPE_OF_RECORD: Codepoint = 0;

/// Codepoint of the record identity attribute shared by every record type.
pub const IDENTITY: Codepoint = 1;

/// Wire-level representation of a record: codepoint to primitive value.
pub type AttributeSet = BTreeMap<Codepoint, Value>;

/// A primitive value carried by an attribute set or message property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// UTF-8 string
    String(String),
    /// Signed 32-bit integer
    Int32(i32),
    /// Signed 64-bit integer
    Int64(i64),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Unsigned 64-bit integer
    Uint64(u64),
}

impl Value {
    /// Name of the value variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Uint32(_) => "uint32",
            Self::Uint64(_) => "uint64",
        }
    }

    /// Borrow the string payload, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The u32 payload, if this is a uint32 value.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    /// The u64 payload, if this is a uint64 value.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Uint32(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Uint64(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

/// Conversion between a record field type and its wire [`Value`].
///
/// Implementations report an absent value with [`AttributeError::NotSet`]
/// so the codec can omit optional fields and reject missing required ones.
/// The empty string and numeric zero count as absent.
pub trait Attribute: Sized {
    /// Encode the field into a wire value.
    ///
    /// # Errors
    ///
    /// Returns [`AttributeError::NotSet`] when the field holds no value, or
    /// another error when the value cannot be represented on the wire.
    fn encode_attribute(&self) -> Result<Value, AttributeError>;

    /// Decode a wire value into the field type.
    ///
    /// # Errors
    ///
    /// Returns error if the value has the wrong type or is out of range.
    fn decode_attribute(value: &Value) -> Result<Self, AttributeError>;
}

impl Attribute for String {
    fn encode_attribute(&self) -> Result<Value, AttributeError> {
        if self.is_empty() {
            return Err(AttributeError::NotSet);
        }
        Ok(Value::String(self.clone()))
    }

    fn decode_attribute(value: &Value) -> Result<Self, AttributeError> {
        match value {
            Value::String(v) => Ok(v.clone()),
            other => Err(AttributeError::UnexpectedType {
                expected: "string",
                actual: other.kind(),
            }),
        }
    }
}

macro_rules! primitive_attribute {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl Attribute for $ty {
            fn encode_attribute(&self) -> Result<Value, AttributeError> {
                if *self == 0 {
                    return Err(AttributeError::NotSet);
                }
                Ok(Value::$variant(*self))
            }

            fn decode_attribute(value: &Value) -> Result<Self, AttributeError> {
                match value {
                    Value::$variant(v) => Ok(*v),
                    other => Err(AttributeError::UnexpectedType {
                        expected: $kind,
                        actual: other.kind(),
                    }),
                }
            }
        }
    };
}

primitive_attribute!(i32, Int32, "int32");
primitive_attribute!(i64, Int64, "int64");
primitive_attribute!(u32, Uint32, "uint32");
primitive_attribute!(u64, Uint64, "uint64");

impl<A: Attribute> Attribute for Option<A> {
    fn encode_attribute(&self) -> Result<Value, AttributeError> {
        match self {
            Some(inner) => inner.encode_attribute(),
            None => Err(AttributeError::NotSet),
        }
    }

    fn decode_attribute(value: &Value) -> Result<Self, AttributeError> {
        A::decode_attribute(value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_pass_through() {
        assert_eq!(
            "router".to_string().encode_attribute().unwrap(),
            Value::String("router".into())
        );
        assert_eq!(7_u64.encode_attribute().unwrap(), Value::Uint64(7));
        assert_eq!((-3_i32).encode_attribute().unwrap(), Value::Int32(-3));
        assert_eq!(u32::decode_attribute(&Value::Uint32(9)).unwrap(), 9);
    }

    #[test]
    fn zero_values_are_not_set() {
        assert!(matches!(String::new().encode_attribute(), Err(AttributeError::NotSet)));
        assert!(matches!(0_i32.encode_attribute(), Err(AttributeError::NotSet)));
        assert!(matches!(0_i64.encode_attribute(), Err(AttributeError::NotSet)));
        assert!(matches!(0_u32.encode_attribute(), Err(AttributeError::NotSet)));
        assert!(matches!(0_u64.encode_attribute(), Err(AttributeError::NotSet)));
        assert!(matches!(Some(String::new()).encode_attribute(), Err(AttributeError::NotSet)));
        assert!(matches!(Some(0_u64).encode_attribute(), Err(AttributeError::NotSet)));
    }

    #[test]
    fn primitive_rejects_other_variant() {
        let err = u64::decode_attribute(&Value::Uint32(1)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected attribute type uint32, expected uint64"
        );
    }

    #[test]
    fn option_none_is_not_set() {
        let absent: Option<String> = None;
        assert!(matches!(
            absent.encode_attribute(),
            Err(AttributeError::NotSet)
        ));
        let decoded = Option::<i64>::decode_attribute(&Value::Int64(-4)).unwrap();
        assert_eq!(decoded, Some(-4));
    }
}
