//! # vanflow core
//!
//! Record model and wire codec for the vanflow event protocol.
//!
//! This crate provides:
//! - Primitive attribute values and the [`Attribute`] contract
//! - [`Time`], carried on the wire as microseconds since the UNIX epoch
//! - Explicit per-type field tables ([`FieldSet`]) and the [`record!`] macro
//! - The process-wide [`Registry`] mapping record types to codepoints
//! - The standard vanflow record types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod record;
pub mod records;

pub use codec::{
    decode, encode, Attribute, AttributeError, AttributeSet, Codepoint, DecodeError, EncodeError,
    Field, FieldSet, Fields, Registry, RegistrationError, Time, Value, IDENTITY, TYPE_OF_RECORD,
};
pub use record::{BaseRecord, Record, RecordRef};
pub use records::*;
