//! Per-type field tables.
//!
//! A [`FieldSet`] is built once per record type when the type is registered.
//! Each entry pairs a codepoint with accessor-driven encode and decode
//! functions, so encoding a record is a walk over a flat list with no type
//! inspection at the call site. Nested groups are flattened with
//! [`FieldSet::embed`].

use crate::codec::error::{AttributeError, DecodeError, EncodeError, RegistrationError};
use crate::codec::value::{Attribute, AttributeSet, Codepoint, Value};
use std::collections::HashMap;
use std::fmt;

type EncodeFn<T> = Box<dyn Fn(&T) -> Result<Value, AttributeError> + Send + Sync>;
type DecodeFn<T> = Box<dyn Fn(&mut T, &Value) -> Result<(), AttributeError> + Send + Sync>;

/// A type whose attributes are described by a [`FieldSet`].
pub trait Fields: Sized + 'static {
    /// Describe the attributes of this type.
    fn fields() -> FieldSet<Self>;
}

/// One attribute of a record type.
pub struct Field<T> {
    name: &'static str,
    codepoint: Codepoint,
    required: bool,
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

impl<T> Field<T> {
    /// Field name used in error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attribute codepoint.
    #[must_use]
    pub fn codepoint(&self) -> Codepoint {
        self.codepoint
    }

    /// Whether the field is part of the record identity.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("codepoint", &self.codepoint)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Ordered list of the attributes of a record type.
pub struct FieldSet<T> {
    fields: Vec<Field<T>>,
}

impl<T> fmt::Debug for FieldSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.fields).finish()
    }
}

impl<T: 'static> Default for FieldSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> FieldSet<T> {
    /// Create an empty field set.
    #[must_use]
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Add an optional attribute.
    #[must_use]
    pub fn field<A>(
        self,
        name: &'static str,
        codepoint: Codepoint,
        get: fn(&T) -> &A,
        get_mut: fn(&mut T) -> &mut A,
    ) -> Self
    where
        A: Attribute + 'static,
    {
        self.push(name, codepoint, false, get, get_mut)
    }

    /// Add a required (identity) attribute.
    #[must_use]
    pub fn required<A>(
        self,
        name: &'static str,
        codepoint: Codepoint,
        get: fn(&T) -> &A,
        get_mut: fn(&mut T) -> &mut A,
    ) -> Self
    where
        A: Attribute + 'static,
    {
        self.push(name, codepoint, true, get, get_mut)
    }

    fn push<A>(
        mut self,
        name: &'static str,
        codepoint: Codepoint,
        required: bool,
        get: fn(&T) -> &A,
        get_mut: fn(&mut T) -> &mut A,
    ) -> Self
    where
        A: Attribute + 'static,
    {
        self.fields.push(Field {
            name,
            codepoint,
            required,
            encode: Box::new(move |record| get(record).encode_attribute()),
            decode: Box::new(move |record, value| {
                *get_mut(record) = A::decode_attribute(value)?;
                Ok(())
            }),
        });
        self
    }

    /// Flatten the attributes of a nested group into this set.
    #[must_use]
    pub fn embed<U: Fields>(mut self, get: fn(&T) -> &U, get_mut: fn(&mut T) -> &mut U) -> Self {
        for inner in U::fields().fields {
            let Field {
                name,
                codepoint,
                required,
                encode,
                decode,
            } = inner;
            self.fields.push(Field {
                name,
                codepoint,
                required,
                encode: Box::new(move |record| encode(get(record))),
                decode: Box::new(move |record, value| decode(get_mut(record), value)),
            });
        }
        self
    }

    /// Iterate over the fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Field<T>> {
        self.fields.iter()
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the set has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reject field sets that reuse a codepoint.
    pub(crate) fn check_unique(&self) -> Result<(), RegistrationError> {
        let mut seen: HashMap<Codepoint, &'static str> = HashMap::new();
        for field in &self.fields {
            if let Some(existing) = seen.insert(field.codepoint, field.name) {
                return Err(RegistrationError::DuplicateField {
                    field: field.name,
                    existing,
                    codepoint: field.codepoint,
                });
            }
        }
        Ok(())
    }

    /// Encode every set attribute of `record`.
    ///
    /// # Errors
    ///
    /// Returns error if a required field is not set or a field fails to
    /// encode.
    pub fn encode(&self, record: &T) -> Result<AttributeSet, EncodeError> {
        let mut attrs = AttributeSet::new();
        for field in &self.fields {
            match (field.encode)(record) {
                Ok(value) => {
                    attrs.insert(field.codepoint, value);
                }
                Err(AttributeError::NotSet) if field.required => {
                    return Err(EncodeError::MissingRequired { field: field.name });
                }
                Err(AttributeError::NotSet) => {}
                Err(source) => {
                    return Err(EncodeError::Field {
                        field: field.name,
                        source,
                    })
                }
            }
        }
        Ok(attrs)
    }

    /// Decode the known attributes of `attrs` into `record`.
    ///
    /// # Errors
    ///
    /// Returns error if a required attribute is missing or an attribute
    /// fails to decode.
    pub fn decode_into(&self, attrs: &AttributeSet, record: &mut T) -> Result<(), DecodeError> {
        for field in &self.fields {
            let Some(value) = attrs.get(&field.codepoint) else {
                if field.required {
                    return Err(DecodeError::MissingRequired { field: field.name });
                }
                continue;
            };
            (field.decode)(record, value).map_err(|source| DecodeError::Field {
                field: field.name,
                source,
            })?;
        }
        Ok(())
    }
}
