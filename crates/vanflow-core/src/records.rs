//! The standard vanflow record types and their codepoints.

use crate::codec::registry::Registry;
use crate::codec::value::Codepoint;

/// Register every standard record type with `registry`.
///
/// # Panics
///
/// Panics if any standard codepoint or type is already registered.
pub fn register_standard(registry: &Registry) {
    registry.register::<SiteRecord>(SITE);
    registry.register::<RouterRecord>(ROUTER);
    registry.register::<LinkRecord>(LINK);
    registry.register::<ControllerRecord>(CONTROLLER);
    registry.register::<ListenerRecord>(LISTENER);
    registry.register::<ConnectorRecord>(CONNECTOR);
    registry.register::<FlowRecord>(FLOW);
    registry.register::<ProcessRecord>(PROCESS);
    registry.register::<ImageRecord>(IMAGE);
    registry.register::<IngressRecord>(INGRESS);
    registry.register::<EgressRecord>(EGRESS);
    registry.register::<CollectorRecord>(COLLECTOR);
    registry.register::<ProcessGroupRecord>(PROCESS_GROUP);
    registry.register::<HostRecord>(HOST);
    registry.register::<LogRecord>(LOG);
    registry.register::<RouterAccessRecord>(ROUTER_ACCESS);
    registry.register::<TransportBiflowRecord>(TRANSPORT_BIFLOW);
    registry.register::<AppBiflowRecord>(APP_BIFLOW);
}

/// Record type codepoint of [`SiteRecord`].
pub const SITE: Codepoint = 0;
/// Record type codepoint of [`RouterRecord`].
pub const ROUTER: Codepoint = 1;
/// Record type codepoint of [`LinkRecord`].
pub const LINK: Codepoint = 2;
/// Record type codepoint of [`ControllerRecord`].
pub const CONTROLLER: Codepoint = 3;
/// Record type codepoint of [`ListenerRecord`].
pub const LISTENER: Codepoint = 4;
/// Record type codepoint of [`ConnectorRecord`].
pub const CONNECTOR: Codepoint = 5;
/// Record type codepoint of [`FlowRecord`].
pub const FLOW: Codepoint = 6;
/// Record type codepoint of [`ProcessRecord`].
pub const PROCESS: Codepoint = 7;
/// Record type codepoint of [`ImageRecord`].
pub const IMAGE: Codepoint = 8;
/// Record type codepoint of [`IngressRecord`].
pub const INGRESS: Codepoint = 9;
/// Record type codepoint of [`EgressRecord`].
pub const EGRESS: Codepoint = 10;
/// Record type codepoint of [`CollectorRecord`].
pub const COLLECTOR: Codepoint = 11;
/// Record type codepoint of [`ProcessGroupRecord`].
pub const PROCESS_GROUP: Codepoint = 12;
/// Record type codepoint of [`HostRecord`].
pub const HOST: Codepoint = 13;
/// Record type codepoint of [`LogRecord`].
pub const LOG: Codepoint = 14;
/// Record type codepoint of [`RouterAccessRecord`].
pub const ROUTER_ACCESS: Codepoint = 15;
/// Record type codepoint of [`TransportBiflowRecord`].
pub const TRANSPORT_BIFLOW: Codepoint = 16;
/// Record type codepoint of [`AppBiflowRecord`].
pub const APP_BIFLOW: Codepoint = 17;

crate::record! {
    /// A site hosting one or more routers.
    pub struct SiteRecord {
        location: String => 9,
        provider: String => 10,
        platform: String => 11,
        namespace: String => 12,
        name: String => 30,
        version: String => 32,
    }
}

crate::record! {
    /// A router process.
    pub struct RouterRecord {
        parent: String => 2,
        namespace: String => 12,
        mode: String => 13,
        image_name: String => 20,
        image_version: String => 21,
        hostname: String => 22,
        name: String => 30,
        build_version: String => 32,
    }
}

crate::record! {
    /// An inter-router link.
    pub struct LinkRecord {
        parent: String => 2,
        peer: String => 6,
        dest_host: String => 15,
        protocol: String => 16,
        dest_port: String => 18,
        octets: u64 => 23,
        result: String => 28,
        reason: String => 29,
        name: String => 30,
        link_cost: u64 => 33,
        octet_rate: u64 => 35,
        status: String => 53,
        role: String => 54,
        last_up: u64 => 55,
        last_down: u64 => 56,
        down_count: u64 => 57,
        octets_reverse: u64 => 58,
        octet_rate_reverse: u64 => 59,
    }
}

crate::record! {
    /// A site controller.
    pub struct ControllerRecord {
        parent: String => 2,
        image_name: String => 20,
        image_version: String => 21,
        hostname: String => 22,
        name: String => 30,
        build_version: String => 32,
    }
}

crate::record! {
    /// A service listener on a router.
    pub struct ListenerRecord {
        parent: String => 2,
        dest_host: String => 15,
        protocol: String => 16,
        dest_port: String => 18,
        address: String => 19,
        name: String => 30,
        flow_count_l4: u64 => 40,
        flow_count_l7: u64 => 41,
        flow_rate_l4: u64 => 42,
        flow_rate_l7: u64 => 43,
    }
}

crate::record! {
    /// A service connector on a router.
    pub struct ConnectorRecord {
        parent: String => 2,
        process_id: String => 7,
        dest_host: String => 15,
        protocol: String => 16,
        dest_port: String => 18,
        address: String => 19,
        name: String => 30,
        flow_count_l4: u64 => 40,
        flow_count_l7: u64 => 41,
        flow_rate_l4: u64 => 42,
        flow_rate_l7: u64 => 43,
    }
}

crate::record! {
    /// One direction of a transport or application flow.
    pub struct FlowRecord {
        parent: String => 2,
        counterflow: String => 5,
        source_host: String => 14,
        source_port: String => 17,
        octets: u64 => 23,
        latency: u64 => 24,
        method: String => 27,
        result: String => 28,
        reason: String => 29,
        trace: String => 31,
        octet_rate: u64 => 35,
        octets_out: u64 => 36,
        octets_unacked: u64 => 37,
        window_closures: u64 => 38,
        window_size: u64 => 39,
    }
}

crate::record! {
    /// A workload process.
    pub struct ProcessRecord {
        parent: String => 2,
        mode: String => 13,
        source_host: String => 14,
        image_name: String => 20,
        image_version: String => 21,
        hostname: String => 22,
        name: String => 30,
        group: String => 46,
    }
}

crate::record! {
    /// A container image.
    pub struct ImageRecord {}
}

crate::record! {
    /// An ingress point.
    pub struct IngressRecord {}
}

crate::record! {
    /// An egress point.
    pub struct EgressRecord {}
}

crate::record! {
    /// A flow collector.
    pub struct CollectorRecord {}
}

crate::record! {
    /// A group of related processes.
    pub struct ProcessGroupRecord {}
}

crate::record! {
    /// A host machine.
    pub struct HostRecord {
        provider: String => 10,
        name: String => 30,
    }
}

crate::record! {
    /// A log line emitted by a router.
    pub struct LogRecord {
        log_severity: u64 => 48,
        log_text: String => 49,
        source_file: String => 50,
        source_line: u64 => 51,
    }
}

crate::record! {
    /// A router access point accepting links.
    pub struct RouterAccessRecord {
        parent: String => 2,
        name: String => 30,
        link_count: u64 => 52,
        role: String => 54,
    }
}

crate::record! {
    /// A bidirectional transport flow through a listener and connector.
    pub struct TransportBiflowRecord {
        parent: String => 2,
        source_host: String => 14,
        source_port: String => 17,
        octets: u64 => 23,
        latency: u64 => 24,
        trace: String => 31,
        octets_reverse: u64 => 58,
        connector_id: String => 60,
        latency_reverse: u64 => 61,
        proxy_host: String => 62,
        proxy_port: String => 63,
        error_listener: String => 64,
        error_connector: String => 65,
    }
}

crate::record! {
    /// A bidirectional application-level request flow.
    pub struct AppBiflowRecord {
        parent: String => 2,
        protocol: String => 16,
        latency: u64 => 24,
        method: String => 27,
        result: String => 28,
        octets: u64 => 23,
        octets_reverse: u64 => 58,
    }
}
