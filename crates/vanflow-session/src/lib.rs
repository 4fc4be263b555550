//! # vanflow session
//!
//! Keeps one logical bus connection alive across failures.
//!
//! A [`Container`] owns at most one live [`Session`] at a time and rebuilds it
//! with backoff whenever a link reports a transport failure. [`Sender`] and
//! [`Receiver`] links are created up front and bind lazily to whichever
//! session is current, so callers never observe a reconnect except as a
//! delay.
//!
//! ## Backends
//!
//! - [`MemoryBus`]: in-process router used by tests and single-process setups
//! - [`MqttConnector`]: MQTT broker via `rumqttc`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod container;
pub mod link;
pub mod memory;
pub mod mqtt;
pub mod transport;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use container::{Container, ContainerConfig, ContainerError};
pub use link::{LinkError, Receiver, Sender};
pub use memory::MemoryBus;
pub use mqtt::{MqttConnector, MqttConnectorConfig};
pub use transport::{BusReceiver, BusSender, Connector, Session, TransportError};
