//! Protocol messages and the bus envelope that carries them.

use crate::addresses::{AddressScheme, BEACON_ADDRESS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vanflow_core::{AttributeSet, DecodeError, EncodeError, RecordRef, Registry, Value};

/// Subject of beacon messages.
pub const BEACON_SUBJECT: &str = "BEACON";
/// Subject of heartbeat messages.
pub const HEARTBEAT_SUBJECT: &str = "HEARTBEAT";
/// Subject of flush messages.
pub const FLUSH_SUBJECT: &str = "FLUSH";
/// Subject of record messages.
pub const RECORD_SUBJECT: &str = "RECORD";

/// Routing properties of a bus message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    /// Destination address
    pub to: Option<String>,
    /// Message kind
    pub subject: Option<String>,
    /// Address replies should be sent to
    pub reply_to: Option<String>,
}

/// Payload of a bus message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// No payload
    #[default]
    Empty,
    /// Opaque bytes
    Data(Vec<u8>),
    /// Ordered sequence of encoded records
    Records(Vec<AttributeSet>),
}

impl Body {
    fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Data(_) => "data",
            Self::Records(_) => "records",
        }
    }
}

/// Generic bus message envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Routing properties
    pub properties: Option<Properties>,
    /// Free-form application properties
    pub application_properties: BTreeMap<String, Value>,
    /// Payload
    pub body: Body,
}

impl Message {
    /// Destination address, if set.
    #[must_use]
    pub fn to(&self) -> Option<&str> {
        self.properties.as_ref()?.to.as_deref()
    }

    /// Subject, if set.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.properties.as_ref()?.subject.as_deref()
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    fn string_property(&self, key: &str) -> String {
        self.application_properties
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn u32_property(&self, key: &str) -> u32 {
        self.application_properties
            .get(key)
            .and_then(Value::as_u32)
            .unwrap_or_default()
    }

    fn u64_property(&self, key: &str) -> u64 {
        self.application_properties
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or_default()
    }
}

/// Routing fields shared by every message kind. Empty strings mean unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProps {
    /// Destination address
    pub to: String,
    /// Message kind
    pub subject: String,
    /// Address replies should be sent to
    pub reply_to: String,
}

impl MessageProps {
    fn from_message(msg: &Message) -> Self {
        let props = msg.properties.clone().unwrap_or_default();
        Self {
            to: props.to.unwrap_or_default(),
            subject: props.subject.unwrap_or_default(),
            reply_to: props.reply_to.unwrap_or_default(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Presence advertisement of an event source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeaconMessage {
    /// Routing fields
    pub props: MessageProps,
    /// Protocol version
    pub version: u32,
    /// Kind of event source (e.g. `ROUTER`, `CONTROLLER`)
    pub source_type: String,
    /// Address the source publishes on
    pub address: String,
    /// Address the source accepts control messages on
    pub direct: String,
    /// Source ID
    pub identity: String,
}

impl BeaconMessage {
    /// Build the envelope. Sent to the shared beacon address unless
    /// `props.to` overrides it.
    #[must_use]
    pub fn encode(&self) -> Message {
        let to = non_empty(&self.props.to).unwrap_or_else(|| BEACON_ADDRESS.to_string());
        Message {
            properties: Some(Properties {
                to: Some(to),
                subject: Some(BEACON_SUBJECT.to_string()),
                reply_to: None,
            }),
            application_properties: BTreeMap::from([
                ("v".to_string(), Value::Uint32(self.version)),
                (
                    "sourceType".to_string(),
                    Value::String(self.source_type.clone()),
                ),
                ("address".to_string(), Value::String(self.address.clone())),
                ("direct".to_string(), Value::String(self.direct.clone())),
                ("id".to_string(), Value::String(self.identity.clone())),
            ]),
            body: Body::Empty,
        }
    }

    fn decode(msg: &Message) -> Self {
        Self {
            props: MessageProps::from_message(msg),
            version: msg.u32_property("v"),
            source_type: msg.string_property("sourceType"),
            address: msg.string_property("address"),
            direct: msg.string_property("direct"),
            identity: msg.string_property("id"),
        }
    }
}

/// Liveness message of an event source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatMessage {
    /// Routing fields
    pub props: MessageProps,
    /// Source ID
    pub identity: String,
    /// Protocol version
    pub version: u32,
    /// Send time in microseconds since the UNIX epoch
    pub now: u64,
}

impl HeartbeatMessage {
    /// Build the envelope. Sent to the source address of `identity` unless
    /// `props.to` overrides it.
    #[must_use]
    pub fn encode(&self) -> Message {
        let to = non_empty(&self.props.to)
            .unwrap_or_else(|| AddressScheme::default().source(&self.identity));
        Message {
            properties: Some(Properties {
                to: Some(to),
                subject: Some(HEARTBEAT_SUBJECT.to_string()),
                reply_to: None,
            }),
            application_properties: BTreeMap::from([
                ("v".to_string(), Value::Uint32(self.version)),
                ("now".to_string(), Value::Uint64(self.now)),
                ("id".to_string(), Value::String(self.identity.clone())),
            ]),
            body: Body::Empty,
        }
    }

    fn decode(msg: &Message) -> Self {
        Self {
            props: MessageProps::from_message(msg),
            identity: msg.string_property("id"),
            version: msg.u32_property("v"),
            now: msg.u64_property("now"),
        }
    }
}

/// Request for a full state dump, sent to a source's direct address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushMessage {
    /// Routing fields
    pub props: MessageProps,
}

impl FlushMessage {
    /// Flush request addressed to `to`.
    #[must_use]
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            props: MessageProps {
                to: to.into(),
                ..MessageProps::default()
            },
        }
    }

    /// Build the envelope.
    #[must_use]
    pub fn encode(&self) -> Message {
        Message {
            properties: Some(Properties {
                to: Some(self.props.to.clone()),
                subject: Some(FLUSH_SUBJECT.to_string()),
                reply_to: non_empty(&self.props.reply_to),
            }),
            application_properties: BTreeMap::new(),
            body: Body::Empty,
        }
    }

    fn decode(msg: &Message) -> Self {
        Self {
            props: MessageProps::from_message(msg),
        }
    }
}

/// A batch of records.
#[derive(Debug, Clone, Default)]
pub struct RecordMessage {
    /// Routing fields
    pub props: MessageProps,
    /// Records in send order
    pub records: Vec<RecordRef>,
}

impl RecordMessage {
    /// Record message addressed to `to`.
    #[must_use]
    pub fn new(to: impl Into<String>, records: Vec<RecordRef>) -> Self {
        Self {
            props: MessageProps {
                to: to.into(),
                ..MessageProps::default()
            },
            records,
        }
    }

    /// Build the envelope, encoding every record.
    ///
    /// # Errors
    ///
    /// Returns error if any record fails to encode.
    pub fn encode(&self) -> Result<Message, MessageError> {
        let registry = Registry::global();
        let records = self
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                registry
                    .encode(record.as_ref())
                    .map_err(|source| MessageError::EncodeRecord { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Message {
            properties: Some(Properties {
                to: Some(self.props.to.clone()),
                subject: Some(RECORD_SUBJECT.to_string()),
                reply_to: None,
            }),
            application_properties: BTreeMap::new(),
            body: Body::Records(records),
        })
    }

    fn decode(msg: &Message) -> Result<Self, MessageError> {
        let Body::Records(sets) = &msg.body else {
            return Err(MessageError::UnexpectedBody(msg.body.kind()));
        };
        let registry = Registry::global();
        let records = sets
            .iter()
            .enumerate()
            .map(|(index, attrs)| {
                registry
                    .decode(attrs)
                    .map_err(|source| MessageError::DecodeRecord { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            props: MessageProps::from_message(msg),
            records,
        })
    }
}

impl PartialEq for RecordMessage {
    fn eq(&self, other: &Self) -> bool {
        let registry = Registry::global();
        self.props == other.props
            && self.records.len() == other.records.len()
            && self
                .records
                .iter()
                .zip(&other.records)
                .all(|(a, b)| registry.equivalent(a.as_ref(), b.as_ref()))
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// Presence advertisement
    Beacon(BeaconMessage),
    /// Liveness message
    Heartbeat(HeartbeatMessage),
    /// Flush request
    Flush(FlushMessage),
    /// Record batch
    Record(RecordMessage),
}

/// Decode an envelope into one of the protocol messages by its subject.
///
/// # Errors
///
/// Returns error if the envelope has no properties or subject, the subject
/// is unknown, or a record message fails to decode.
pub fn decode(msg: &Message) -> Result<DecodedMessage, MessageError> {
    let Some(properties) = &msg.properties else {
        return Err(MessageError::MissingProperties);
    };
    let Some(subject) = properties.subject.as_deref() else {
        return Err(MessageError::MissingSubject);
    };
    match subject {
        BEACON_SUBJECT => Ok(DecodedMessage::Beacon(BeaconMessage::decode(msg))),
        HEARTBEAT_SUBJECT => Ok(DecodedMessage::Heartbeat(HeartbeatMessage::decode(msg))),
        FLUSH_SUBJECT => Ok(DecodedMessage::Flush(FlushMessage::decode(msg))),
        RECORD_SUBJECT => RecordMessage::decode(msg).map(DecodedMessage::Record),
        other => Err(MessageError::UnknownSubject(other.to_string())),
    }
}

/// Errors for message encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// The envelope carries no properties
    #[error("cannot decode message without properties")]
    MissingProperties,
    /// The envelope carries no subject
    #[error("cannot decode message without subject")]
    MissingSubject,
    /// The subject names no known message kind
    #[error("cannot decode message with subject {0:?}")]
    UnknownSubject(String),
    /// A record message body is not a record sequence
    #[error("unexpected type for message body: {0}")]
    UnexpectedBody(&'static str),
    /// A record failed to encode
    #[error("error encoding record {index}: {source}")]
    EncodeRecord {
        /// Position in the batch
        index: usize,
        /// Codec error
        source: EncodeError,
    },
    /// A record failed to decode
    #[error("error decoding record {index}: {source}")]
    DecodeRecord {
        /// Position in the batch
        index: usize,
        /// Codec error
        source: DecodeError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vanflow_core::{LogRecord, RouterRecord, SiteRecord};

    #[test]
    fn beacon_defaults_to_shared_address() {
        let beacon = BeaconMessage {
            version: 1,
            source_type: "CONTROLLER".into(),
            address: "mc/sfe.abc".into(),
            direct: "sfe.abc".into(),
            identity: "abc".into(),
            ..BeaconMessage::default()
        };
        let msg = beacon.encode();
        assert_eq!(msg.to(), Some(BEACON_ADDRESS));
        assert_eq!(msg.subject(), Some(BEACON_SUBJECT));
        assert_eq!(msg.application_properties["v"], Value::Uint32(1));
        assert_eq!(
            msg.application_properties["sourceType"],
            Value::from("CONTROLLER")
        );

        let DecodedMessage::Beacon(decoded) = decode(&msg).unwrap() else {
            panic!("expected beacon");
        };
        assert_eq!(decoded.identity, "abc");
        assert_eq!(decoded.direct, "sfe.abc");
        assert_eq!(decoded.props.to, BEACON_ADDRESS);
    }

    #[test]
    fn heartbeat_targets_source_address() {
        let heartbeat = HeartbeatMessage {
            identity: "abc".into(),
            version: 1,
            now: 1_704_067_200_000_000,
            ..HeartbeatMessage::default()
        };
        let msg = heartbeat.encode();
        assert_eq!(msg.to(), Some("mc/sfe.abc"));

        let mut alternate = heartbeat.clone();
        alternate.props.to = "mc/sfe.abc.heartbeats".into();
        assert_eq!(alternate.encode().to(), Some("mc/sfe.abc.heartbeats"));

        let DecodedMessage::Heartbeat(decoded) = decode(&msg).unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(decoded.now, heartbeat.now);
        assert_eq!(decoded.identity, "abc");
    }

    #[test]
    fn missing_properties_default_to_empty() {
        let mut msg = HeartbeatMessage::default().encode();
        msg.application_properties.clear();
        msg.application_properties
            .insert("now".into(), Value::from("not a number"));
        let DecodedMessage::Heartbeat(decoded) = decode(&msg).unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(decoded.now, 0);
        assert_eq!(decoded.version, 0);
        assert!(decoded.identity.is_empty());
    }

    #[test]
    fn flush_carries_reply_to() {
        let mut flush = FlushMessage::new("sfe.abc");
        flush.props.reply_to = "sfe.me".into();
        let msg = flush.encode();
        assert!(msg.application_properties.is_empty());

        let DecodedMessage::Flush(decoded) = decode(&msg).unwrap() else {
            panic!("expected flush");
        };
        assert_eq!(decoded.props.to, "sfe.abc");
        assert_eq!(decoded.props.reply_to, "sfe.me");
        assert_eq!(decoded.props.subject, FLUSH_SUBJECT);
    }

    #[test]
    fn record_message_round_trips_in_order() {
        let mut router = RouterRecord::new("r1");
        router.name = Some("router-1".into());
        let message = RecordMessage::new(
            "mc/sfe.abc",
            vec![
                Arc::new(SiteRecord::new("s1")),
                Arc::new(router),
                Arc::new(LogRecord::new("l1")),
            ],
        );
        let msg = message.encode().unwrap();
        let Body::Records(sets) = &msg.body else {
            panic!("expected record body");
        };
        assert_eq!(sets.len(), 3);

        let bytes = msg.to_cbor().unwrap();
        let decoded = decode(&Message::from_cbor(&bytes).unwrap()).unwrap();
        let DecodedMessage::Record(mut decoded) = decoded else {
            panic!("expected record message");
        };
        decoded.props.subject.clear();
        assert_eq!(decoded, message);
        assert_eq!(decoded.records[1].identity(), "r1");
    }

    #[test]
    fn one_bad_record_fails_the_message() {
        let mut msg = RecordMessage::new("x", vec![Arc::new(SiteRecord::new("s1"))])
            .encode()
            .unwrap();
        if let Body::Records(sets) = &mut msg.body {
            sets.push(AttributeSet::from([(0, Value::Uint32(7_777_777))]));
        }
        assert!(matches!(
            decode(&msg),
            Err(MessageError::DecodeRecord { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert_eq!(
            decode(&Message::default()).unwrap_err(),
            MessageError::MissingProperties
        );

        let no_subject = Message {
            properties: Some(Properties::default()),
            ..Message::default()
        };
        assert_eq!(decode(&no_subject).unwrap_err(), MessageError::MissingSubject);

        let lowercase = Message {
            properties: Some(Properties {
                subject: Some("beacon".into()),
                ..Properties::default()
            }),
            ..Message::default()
        };
        assert_eq!(
            decode(&lowercase).unwrap_err().to_string(),
            "cannot decode message with subject \"beacon\""
        );

        let wrong_body = Message {
            properties: Some(Properties {
                subject: Some(RECORD_SUBJECT.into()),
                ..Properties::default()
            }),
            body: Body::Data(vec![1, 2]),
            ..Message::default()
        };
        assert_eq!(
            decode(&wrong_body).unwrap_err(),
            MessageError::UnexpectedBody("data")
        );
    }
}
