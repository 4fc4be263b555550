//! Event source descriptions.

use chrono::{DateTime, Utc};
use vanflow_proto::{AddressScheme, BeaconMessage};

/// What is known about an event source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Info {
    /// Source ID
    pub id: String,
    /// Protocol version
    pub version: u32,
    /// Kind of event source (e.g. `ROUTER`, `CONTROLLER`)
    pub source_type: String,
    /// Multicast address the source publishes on
    pub address: String,
    /// Address the source accepts flush requests on
    pub direct: String,
    /// Last time the source was heard from
    pub last_seen: DateTime<Utc>,
}

impl Info {
    /// Describe source `id` using the default address scheme.
    #[must_use]
    pub fn new(id: impl Into<String>, source_type: impl Into<String>) -> Self {
        let id = id.into();
        let scheme = AddressScheme::default();
        Self {
            address: scheme.source(&id),
            direct: scheme.direct(&id),
            source_type: source_type.into(),
            version: 1,
            id,
            last_seen: DateTime::default(),
        }
    }

    /// Describe the source a beacon announces, seen at `seen`.
    #[must_use]
    pub fn from_beacon(beacon: &BeaconMessage, seen: DateTime<Utc>) -> Self {
        Self {
            id: beacon.identity.clone(),
            version: beacon.version,
            source_type: beacon.source_type.clone(),
            address: beacon.address.clone(),
            direct: beacon.direct.clone(),
            last_seen: seen,
        }
    }

    /// Beacon advertising this source.
    #[must_use]
    pub fn beacon(&self) -> BeaconMessage {
        BeaconMessage {
            version: self.version,
            source_type: self.source_type.clone(),
            address: self.address.clone(),
            direct: self.direct.clone(),
            identity: self.id.clone(),
            ..BeaconMessage::default()
        }
    }
}
