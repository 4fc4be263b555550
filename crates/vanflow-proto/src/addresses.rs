//! Address conventions for event sources.
//!
//! Address structure:
//! - `mc/sfe.all` shared beacon address
//! - `mc/sfe.<id>` source address (records, heartbeats)
//! - `mc/sfe.<id>.heartbeats`, `.logs`, `.flows` alternate source addresses
//! - `sfe.<id>` direct address (flush requests)
//!
//! Addresses with the `mc/` prefix are multicast: every subscriber receives
//! every message.

/// Shared address every event source sends beacons to.
pub const BEACON_ADDRESS: &str = "mc/sfe.all";

/// Prefix marking a multicast address.
pub const MULTICAST_PREFIX: &str = "mc/";

/// Suffix of the alternate heartbeat address.
pub const HEARTBEATS_SUFFIX: &str = ".heartbeats";

/// Suffix of the log record address.
pub const LOGS_SUFFIX: &str = ".logs";

/// Suffix of the flow record address.
pub const FLOWS_SUFFIX: &str = ".flows";

/// Whether messages sent to `address` fan out to every subscriber.
#[must_use]
pub fn is_multicast(address: &str) -> bool {
    address.starts_with(MULTICAST_PREFIX)
}

/// Address builder for event sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressScheme {
    /// Node prefix (default: "sfe")
    pub prefix: String,
}

impl Default for AddressScheme {
    fn default() -> Self {
        Self {
            prefix: "sfe".to_string(),
        }
    }
}

impl AddressScheme {
    /// Create an address scheme with a custom prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Shared beacon address.
    #[must_use]
    pub fn beacon(&self) -> String {
        format!("{MULTICAST_PREFIX}{}.all", self.prefix)
    }

    /// Multicast address a source publishes records and heartbeats on.
    #[must_use]
    pub fn source(&self, id: &str) -> String {
        format!("{MULTICAST_PREFIX}{}.{id}", self.prefix)
    }

    /// Point-to-point address a source accepts control messages on.
    #[must_use]
    pub fn direct(&self, id: &str) -> String {
        format!("{}.{id}", self.prefix)
    }

    /// Alternate heartbeat address of a source.
    #[must_use]
    pub fn heartbeats(&self, id: &str) -> String {
        self.source(id) + HEARTBEATS_SUFFIX
    }

    /// Log record address of a source.
    #[must_use]
    pub fn logs(&self, id: &str) -> String {
        self.source(id) + LOGS_SUFFIX
    }

    /// Flow record address of a source.
    #[must_use]
    pub fn flows(&self, id: &str) -> String {
        self.source(id) + FLOWS_SUFFIX
    }

    /// Parse an address to extract the source ID and address kind.
    #[must_use]
    pub fn parse(&self, address: &str) -> Option<(String, AddressKind)> {
        let (rest, multicast) = match address.strip_prefix(MULTICAST_PREFIX) {
            Some(rest) => (rest, true),
            None => (address, false),
        };
        let id = rest.strip_prefix(self.prefix.as_str())?.strip_prefix('.')?;
        if id.is_empty() {
            return None;
        }
        if !multicast {
            return Some((id.to_string(), AddressKind::Direct));
        }
        if id == "all" {
            return Some((String::new(), AddressKind::Beacon));
        }
        for (suffix, kind) in [
            (HEARTBEATS_SUFFIX, AddressKind::Heartbeats),
            (LOGS_SUFFIX, AddressKind::Logs),
            (FLOWS_SUFFIX, AddressKind::Flows),
        ] {
            if let Some(id) = id.strip_suffix(suffix) {
                return Some((id.to_string(), kind));
            }
        }
        Some((id.to_string(), AddressKind::Source))
    }
}

/// Kinds of event source addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Shared beacon address
    Beacon,
    /// Source address
    Source,
    /// Direct address
    Direct,
    /// Alternate heartbeat address
    Heartbeats,
    /// Log record address
    Logs,
    /// Flow record address
    Flows,
}
