//! # vanflow event sources
//!
//! The protocol layer of vanflow, built on a [`Container`](vanflow_session::Container).
//!
//! ## Components
//!
//! - [`Discovery`]: tracks event sources announcing themselves with beacons
//!   and forgets sources whose watch sees no activity
//! - [`Client`]: listens to one remote source and dispatches its heartbeats
//!   and records to registered handlers
//! - [`Manager`]: advertises a local source, answers flush requests with a
//!   dump of its stores and streams record deltas
//!
//! ## Lifecycle of a source
//!
//! ```text
//! unknown --beacon--> known --watch timeout / forget--> forgotten
//! ```
//!
//! A beacon arriving after a source was forgotten creates a fresh entry.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod discovery;
pub mod info;
pub mod manager;

pub use client::{flush_on_first_message, Client, ClientError, ClientOptions, HandlerId, SourceAddress};
pub use discovery::{Discovery, DiscoveryError, DiscoveryHandlers, DiscoveryOptions, WatchConfig};
pub use info::Info;
pub use manager::{Manager, ManagerConfig, ManagerError, RecordUpdate};
