//! Conversion between typed records and wire attribute sets.
//!
//! A record type describes its attributes once, as a [`FieldSet`], and is
//! registered against a type codepoint in a [`Registry`]. Encoding walks the
//! field table; decoding selects the type from codepoint 0 and fills a
//! default value field by field. Unknown codepoints are ignored on decode so
//! newer publishers stay readable.

pub mod error;
pub mod fields;
pub mod registry;
pub mod time;
pub mod value;

pub use error::{AttributeError, DecodeError, EncodeError, RegistrationError};
pub use fields::{Field, FieldSet, Fields};
pub use registry::Registry;
pub use time::Time;
pub use value::{Attribute, AttributeSet, Codepoint, Value, IDENTITY, TYPE_OF_RECORD};

use crate::record::{Record, RecordRef};

/// Encode a record with the global registry.
///
/// # Errors
///
/// See [`Registry::encode`].
pub fn encode(record: &dyn Record) -> Result<AttributeSet, EncodeError> {
    Registry::global().encode(record)
}

/// Decode an attribute set with the global registry.
///
/// # Errors
///
/// See [`Registry::decode`].
pub fn decode(attrs: &AttributeSet) -> Result<RecordRef, DecodeError> {
    Registry::global().decode(attrs)
}
