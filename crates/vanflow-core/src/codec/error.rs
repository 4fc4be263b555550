//! Codec error types.

use crate::codec::value::Codepoint;

/// Errors produced while converting a single field to or from a [`Value`](super::Value).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    /// The field holds no value
    #[error("attribute not set")]
    NotSet,
    /// The wire value has a different type than the field expects
    #[error("unexpected attribute type {actual}, expected {expected}")]
    UnexpectedType {
        /// Expected value kind
        expected: &'static str,
        /// Actual value kind
        actual: &'static str,
    },
    /// A time value predates the UNIX epoch
    #[error("cannot encode time before the unix epoch")]
    BeforeEpoch,
    /// A time value exceeds the representable range
    #[error("time value {0} too far in future")]
    TooFarInFuture(u64),
}

/// Errors produced while encoding a record into an attribute set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The record type was never registered
    #[error("encode error: unregistered record type {0}")]
    Unregistered(&'static str),
    /// A required field holds no value
    #[error("encode error: missing or empty required field {field}")]
    MissingRequired {
        /// Field name
        field: &'static str,
    },
    /// A field failed to encode
    #[error("encode error: error encoding field {field:?}: {source}")]
    Field {
        /// Field name
        field: &'static str,
        /// Underlying attribute error
        source: AttributeError,
    },
}

/// Errors produced while decoding an attribute set into a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The attribute set holds no entries
    #[error("decode error: cannot decode empty record attribute set")]
    Empty,
    /// Codepoint 0 is missing
    #[error("decode error: record type attribute not present")]
    MissingRecordType,
    /// Codepoint 0 holds a value of the wrong type
    #[error("decode error: unexpected type for record type attribute {0:?}")]
    UnexpectedRecordType(&'static str),
    /// Codepoint 0 names a type that was never registered
    #[error("decode error: unknown record type for {0}")]
    UnknownRecordType(Codepoint),
    /// A required field is absent
    #[error("decode error: record attribute set missing required field {field:?}")]
    MissingRequired {
        /// Field name
        field: &'static str,
    },
    /// A field failed to decode
    #[error("decode error: error decoding field {field:?}: {source}")]
    Field {
        /// Field name
        field: &'static str,
        /// Underlying attribute error
        source: AttributeError,
    },
}

/// Errors produced when registering a record type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The record type codepoint is already taken
    #[error("cannot register record type {name} using codepoint {codepoint}: already in use")]
    CodepointInUse {
        /// Type being registered
        name: &'static str,
        /// Conflicting codepoint
        codepoint: Codepoint,
    },
    /// The record type was registered before
    #[error("cannot register same type more than once. type {name} already registered with code {codepoint}")]
    AlreadyRegistered {
        /// Type being registered
        name: &'static str,
        /// Codepoint of the existing registration
        codepoint: Codepoint,
    },
    /// Two fields of one type share a codepoint
    #[error("field {field} repeats codepoint {codepoint} also used by {existing}")]
    DuplicateField {
        /// Field repeating the codepoint
        field: &'static str,
        /// Field that claimed it first
        existing: &'static str,
        /// Shared codepoint
        codepoint: Codepoint,
    },
}
