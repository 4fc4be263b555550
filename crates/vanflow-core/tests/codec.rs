//! Codec behaviour for custom record shapes registered on the global registry.

use std::any::Any;
use std::sync::Once;
use vanflow_core::{
    AttributeSet, BaseRecord, DecodeError, EncodeError, FieldSet, Fields, Record, Registry, Time,
    Value,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Endpoint {
    host: Option<String>,
    port: Option<u32>,
}

impl Fields for Endpoint {
    fn fields() -> FieldSet<Self> {
        FieldSet::<Self>::new()
            .field("host", 200, |r| &r.host, |r| &mut r.host)
            .field("port", 201, |r| &r.port, |r| &mut r.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Everything {
    base: BaseRecord,
    endpoint: Endpoint,
    label: String,
    offset: i32,
    delta: Option<i64>,
    count: Option<u64>,
    seen: Time,
    tenant: Option<String>,
}

impl Fields for Everything {
    fn fields() -> FieldSet<Self> {
        FieldSet::<Self>::new()
            .embed(|r| &r.base, |r| &mut r.base)
            .embed(|r| &r.endpoint, |r| &mut r.endpoint)
            .field("label", 100, |r| &r.label, |r| &mut r.label)
            .field("offset", 101, |r| &r.offset, |r| &mut r.offset)
            .field("delta", 102, |r| &r.delta, |r| &mut r.delta)
            .field("count", 103, |r| &r.count, |r| &mut r.count)
            .field("seen", 104, |r| &r.seen, |r| &mut r.seen)
            .required("tenant", 105, |r| &r.tenant, |r| &mut r.tenant)
    }
}

impl Record for Everything {
    fn identity(&self) -> &str {
        &self.base.id
    }

    fn record_name(&self) -> &'static str {
        "Everything"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

vanflow_core::record! {
    /// Minimal shape declared through the macro.
    struct Gadget {
        colour: String => 300,
        weight: u64 => 301,
    }
}

fn register() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        Registry::global().register::<Everything>(88_801);
        Registry::global().register::<Gadget>(88_802);
    });
}

fn full() -> Everything {
    Everything {
        base: BaseRecord {
            id: "e-1".into(),
            start_time: Time::from_unix_micros(1_000_000),
            end_time: Time::UNSET,
        },
        endpoint: Endpoint {
            host: Some("10.0.0.1".into()),
            port: None,
        },
        label: "primary".into(),
        offset: -7,
        delta: Some(i64::MIN),
        count: Some(u64::MAX),
        seen: Time::from_unix_micros(1_700_000_000_000_001),
        tenant: Some("blue".into()),
    }
}

#[test]
fn nested_and_primitive_fields_round_trip() {
    register();
    let record = full();
    let attrs = vanflow_core::encode(&record).unwrap();

    assert_eq!(attrs[&0], Value::Uint32(88_801));
    assert_eq!(attrs[&200], Value::from("10.0.0.1"));
    assert!(!attrs.contains_key(&201));
    assert!(!attrs.contains_key(&4));
    assert_eq!(attrs[&101], Value::Int32(-7));

    let decoded = vanflow_core::decode(&attrs).unwrap();
    assert_eq!(decoded.downcast_ref::<Everything>(), Some(&record));
}

#[test]
fn optional_field_combinations_round_trip() {
    register();
    for mask in 0_u8..16 {
        let mut record = full();
        if mask & 1 == 0 {
            record.delta = None;
        }
        if mask & 2 == 0 {
            record.count = None;
        }
        if mask & 4 == 0 {
            record.seen = Time::UNSET;
        }
        if mask & 8 == 0 {
            record.endpoint.host = None;
        }
        let attrs = vanflow_core::encode(&record).unwrap();
        let decoded = vanflow_core::decode(&attrs).unwrap();
        assert_eq!(decoded.downcast_ref::<Everything>(), Some(&record), "mask {mask}");
    }
}

#[test]
fn required_field_must_be_set() {
    register();
    let mut record = full();
    record.tenant = None;
    let err = vanflow_core::encode(&record).unwrap_err();
    assert_eq!(err, EncodeError::MissingRequired { field: "tenant" });
    assert!(err.to_string().contains("tenant"));

    let mut attrs = vanflow_core::encode(&full()).unwrap();
    attrs.remove(&105);
    assert_eq!(
        vanflow_core::decode(&attrs).unwrap_err(),
        DecodeError::MissingRequired { field: "tenant" }
    );
}

#[test]
fn zero_values_are_left_off_the_wire() {
    register();
    let mut record = full();
    record.endpoint.host = Some(String::new());
    record.endpoint.port = Some(0);
    record.label = String::new();
    record.offset = 0;
    record.delta = Some(0);
    record.count = Some(0);
    let attrs = vanflow_core::encode(&record).unwrap();
    assert_eq!(
        attrs.keys().copied().collect::<Vec<_>>(),
        vec![0, 1, 3, 104, 105]
    );

    record.tenant = Some(String::new());
    assert_eq!(
        vanflow_core::encode(&record).unwrap_err(),
        EncodeError::MissingRequired { field: "tenant" }
    );
}

#[test]
fn empty_identity_fails_to_encode() {
    register();
    assert_eq!(
        vanflow_core::encode(&Gadget::new("")).unwrap_err(),
        EncodeError::MissingRequired { field: "id" }
    );
}

#[test]
fn macro_declared_record_round_trips() {
    register();
    let mut gadget = Gadget::new("g-1");
    gadget.weight = Some(12);
    let attrs = vanflow_core::encode(&gadget).unwrap();
    assert_eq!(
        attrs,
        AttributeSet::from([
            (0, Value::Uint32(88_802)),
            (1, Value::from("g-1")),
            (301, Value::Uint64(12)),
        ])
    );
    let decoded = vanflow_core::decode(&attrs).unwrap();
    assert_eq!(decoded.downcast_ref::<Gadget>(), Some(&gadget));
}

#[test]
fn global_registry_rejects_standard_codepoint_reuse() {
    register();
    let err = Registry::global().try_register::<Gadget>(3).unwrap_err();
    assert!(err.to_string().contains("already in use"));
}
