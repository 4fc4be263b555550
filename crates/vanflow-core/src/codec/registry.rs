//! Record type registry.
//!
//! Every record type is registered exactly once against its type codepoint
//! before any encode or decode call. The process-wide registry returned by
//! [`Registry::global`] is initialised with the standard vanflow record
//! types; tests and extensions may register additional types on it or build
//! a private [`Registry`].

use crate::codec::error::{DecodeError, EncodeError, RegistrationError};
use crate::codec::fields::Fields;
use crate::codec::value::{AttributeSet, Codepoint, Value, TYPE_OF_RECORD};
use crate::record::{Record, RecordRef};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

type EncodeRecordFn = Box<dyn Fn(&dyn Record) -> Result<AttributeSet, EncodeError> + Send + Sync>;
type DecodeRecordFn = Box<dyn Fn(&AttributeSet) -> Result<RecordRef, DecodeError> + Send + Sync>;

struct RecordType {
    codepoint: Codepoint,
    encode: EncodeRecordFn,
    decode: DecodeRecordFn,
}

#[derive(Default)]
struct Tables {
    by_type: HashMap<TypeId, Arc<RecordType>>,
    by_codepoint: HashMap<Codepoint, Arc<RecordType>>,
}

/// Mapping between record types and their codepoints.
#[derive(Default)]
pub struct Registry {
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut codepoints: Vec<_> = tables.by_codepoint.keys().copied().collect();
        codepoints.sort_unstable();
        f.debug_struct("Registry")
            .field("codepoints", &codepoints)
            .finish()
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, holding the standard vanflow record types.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| {
            let registry = Self::new();
            crate::records::register_standard(&registry);
            registry
        })
    }

    /// Register a record type against a codepoint.
    ///
    /// # Errors
    ///
    /// Returns error if the codepoint or the type is already registered, or
    /// if two fields of the type share a codepoint.
    pub fn try_register<T>(&self, codepoint: Codepoint) -> Result<(), RegistrationError>
    where
        T: Record + Fields + Default,
    {
        let name = std::any::type_name::<T>();
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if tables.by_codepoint.contains_key(&codepoint) {
            return Err(RegistrationError::CodepointInUse { name, codepoint });
        }
        if let Some(existing) = tables.by_type.get(&TypeId::of::<T>()) {
            return Err(RegistrationError::AlreadyRegistered {
                name,
                codepoint: existing.codepoint,
            });
        }

        let fields = T::fields();
        fields.check_unique()?;
        let fields = Arc::new(fields);
        let decode_fields = Arc::clone(&fields);

        let record_type = Arc::new(RecordType {
            codepoint,
            encode: Box::new(move |record| {
                let record = record
                    .downcast_ref::<T>()
                    .ok_or(EncodeError::Unregistered(record.record_name()))?;
                let mut attrs = fields.encode(record)?;
                attrs.insert(TYPE_OF_RECORD, Value::Uint32(codepoint));
                Ok(attrs)
            }),
            decode: Box::new(move |attrs| {
                let mut record = T::default();
                decode_fields.decode_into(attrs, &mut record)?;
                Ok(Arc::new(record) as RecordRef)
            }),
        });
        tables
            .by_type
            .insert(TypeId::of::<T>(), Arc::clone(&record_type));
        tables.by_codepoint.insert(codepoint, record_type);

        tracing::trace!(codepoint, record = name, "Registered record type");
        Ok(())
    }

    /// Register a record type against a codepoint.
    ///
    /// # Panics
    ///
    /// Registration conflicts are programming errors: panics if
    /// [`try_register`](Self::try_register) fails.
    pub fn register<T>(&self, codepoint: Codepoint)
    where
        T: Record + Fields + Default,
    {
        if let Err(err) = self.try_register::<T>(codepoint) {
            panic!("{err}");
        }
    }

    /// The codepoint a record's type is registered with.
    #[must_use]
    pub fn codepoint_of(&self, record: &dyn Record) -> Option<Codepoint> {
        self.lookup_type(record).map(|t| t.codepoint)
    }

    fn lookup_type(&self, record: &dyn Record) -> Option<Arc<RecordType>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_type.get(&record.as_any().type_id()).cloned()
    }

    /// Encode a record into an attribute set.
    ///
    /// # Errors
    ///
    /// Returns error if the record type is unregistered, a required field is
    /// unset, or a field fails to encode.
    pub fn encode(&self, record: &dyn Record) -> Result<AttributeSet, EncodeError> {
        let record_type = self
            .lookup_type(record)
            .ok_or(EncodeError::Unregistered(record.record_name()))?;
        (record_type.encode)(record)
    }

    /// Decode an attribute set into the record type named by codepoint 0.
    ///
    /// # Errors
    ///
    /// Returns error if the set is empty, has no usable record type
    /// attribute, names an unregistered type, or fails field decoding.
    pub fn decode(&self, attrs: &AttributeSet) -> Result<RecordRef, DecodeError> {
        if attrs.is_empty() {
            return Err(DecodeError::Empty);
        }
        let codepoint = match attrs.get(&TYPE_OF_RECORD) {
            None => return Err(DecodeError::MissingRecordType),
            Some(Value::Uint32(codepoint)) => *codepoint,
            Some(other) => return Err(DecodeError::UnexpectedRecordType(other.kind())),
        };
        let record_type = {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            tables.by_codepoint.get(&codepoint).cloned()
        }
        .ok_or(DecodeError::UnknownRecordType(codepoint))?;
        (record_type.decode)(attrs)
    }

    /// Whether two records encode to the same attribute set.
    #[must_use]
    pub fn equivalent(&self, a: &dyn Record, b: &dyn Record) -> bool {
        match (self.encode(a), self.encode(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fields::FieldSet;
    use std::any::Any;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Probe {
        id: String,
        size: Option<u32>,
    }

    impl Fields for Probe {
        fn fields() -> FieldSet<Self> {
            FieldSet::<Self>::new()
                .required("id", 1, |r| &r.id, |r| &mut r.id)
                .field("size", 2, |r| &r.size, |r| &mut r.size)
        }
    }

    impl Record for Probe {
        fn identity(&self) -> &str {
            &self.id
        }

        fn record_name(&self) -> &'static str {
            "Probe"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Default)]
    struct Clash {
        a: u64,
    }

    impl Fields for Clash {
        fn fields() -> FieldSet<Self> {
            FieldSet::<Self>::new()
                .field("a", 5, |r| &r.a, |r| &mut r.a)
                .field("b", 5, |r| &r.a, |r| &mut r.a)
        }
    }

    impl Record for Clash {
        fn identity(&self) -> &str {
            ""
        }

        fn record_name(&self) -> &'static str {
            "Clash"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn stamps_type_codepoint() {
        let registry = Registry::new();
        registry.register::<Probe>(42);
        let attrs = registry
            .encode(&Probe {
                id: "p".into(),
                size: Some(3),
            })
            .unwrap();
        assert_eq!(attrs[&TYPE_OF_RECORD], Value::Uint32(42));
        assert_eq!(attrs[&1], Value::String("p".into()));
        assert_eq!(attrs[&2], Value::Uint32(3));
    }

    #[test]
    fn rejects_reused_codepoint_and_type() {
        let registry = Registry::new();
        registry.register::<Probe>(42);
        assert!(matches!(
            registry.try_register::<Clash>(42),
            Err(RegistrationError::CodepointInUse { codepoint: 42, .. })
        ));
        assert!(matches!(
            registry.try_register::<Probe>(43),
            Err(RegistrationError::AlreadyRegistered { codepoint: 42, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_field_codepoints() {
        let registry = Registry::new();
        assert!(matches!(
            registry.try_register::<Clash>(7),
            Err(RegistrationError::DuplicateField { codepoint: 5, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn register_panics_on_conflict() {
        let registry = Registry::new();
        registry.register::<Probe>(1);
        registry.register::<Clash>(1);
    }

    #[test]
    fn unregistered_type_fails_to_encode() {
        let registry = Registry::new();
        let err = registry.encode(&Probe::default()).unwrap_err();
        assert_eq!(err, EncodeError::Unregistered("Probe"));
    }

    #[test]
    fn decode_rejects_malformed_sets() {
        let registry = Registry::new();
        registry.register::<Probe>(42);

        assert_eq!(
            registry.decode(&AttributeSet::new()).unwrap_err(),
            DecodeError::Empty
        );

        let no_type = AttributeSet::from([(1, Value::from("p"))]);
        assert_eq!(
            registry.decode(&no_type).unwrap_err(),
            DecodeError::MissingRecordType
        );

        let bad_type = AttributeSet::from([(0, Value::from("unknown"))]);
        assert_eq!(
            registry.decode(&bad_type).unwrap_err().to_string(),
            "decode error: unexpected type for record type attribute \"string\""
        );

        let unknown = AttributeSet::from([(0, Value::Uint32(404_404)), (12, Value::from("x"))]);
        assert_eq!(
            registry.decode(&unknown).unwrap_err().to_string(),
            "decode error: unknown record type for 404404"
        );
    }

    #[test]
    fn decode_ignores_unknown_codepoints() {
        let registry = Registry::new();
        registry.register::<Probe>(42);
        let attrs = AttributeSet::from([
            (0, Value::Uint32(42)),
            (1, Value::from("p")),
            (999, Value::Uint64(1)),
        ]);
        let record = registry.decode(&attrs).unwrap();
        assert_eq!(
            record.downcast_ref::<Probe>(),
            Some(&Probe {
                id: "p".into(),
                size: None
            })
        );
    }
}
