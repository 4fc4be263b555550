//! # vanflow protocol
//!
//! Wire messages and address conventions for the vanflow event protocol.
//!
//! ## Messages
//!
//! - `BEACON`: presence advertisement on the shared beacon address
//! - `HEARTBEAT`: liveness on the source address
//! - `FLUSH`: request for a full state dump, sent to the direct address
//! - `RECORD`: a batch of encoded records
//!
//! ## Addresses
//!
//! A source `<id>` publishes on `mc/sfe.<id>` and accepts control messages on
//! `sfe.<id>`. Beacons go to `mc/sfe.all`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addresses;
pub mod messages;

pub use addresses::{AddressKind, AddressScheme, BEACON_ADDRESS};
pub use messages::{
    decode, BeaconMessage, Body, DecodedMessage, FlushMessage, HeartbeatMessage, Message,
    MessageError, MessageProps, Properties, RecordMessage,
};
