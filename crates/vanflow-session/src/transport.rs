//! Transport abstraction the container drives.
//!
//! A [`Connector`] produces sessions; a [`Session`] attaches sender and
//! receiver links to addresses. Implementations report every failure as a
//! [`TransportError`] and never retry on their own.

use async_trait::async_trait;
use std::sync::Arc;
use vanflow_proto::Message;

/// Establishes sessions with a message bus.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and a session on it.
    async fn connect(&self) -> Result<Arc<dyn Session>, TransportError>;
}

/// A live session with a message bus.
#[async_trait]
pub trait Session: Send + Sync {
    /// Attach a sender link to `address`.
    async fn new_sender(&self, address: &str) -> Result<Arc<dyn BusSender>, TransportError>;

    /// Attach a receiver link to `address`, buffering up to `credit` messages.
    async fn new_receiver(
        &self,
        address: &str,
        credit: usize,
    ) -> Result<Arc<dyn BusReceiver>, TransportError>;

    /// Tear down the session and its connection.
    async fn close(&self);
}

/// Sending half of a session link.
#[async_trait]
pub trait BusSender: Send + Sync {
    /// Send one message to the link address.
    async fn send(&self, msg: Message) -> Result<(), TransportError>;

    /// Detach the link.
    async fn close(&self);
}

/// Receiving half of a session link.
#[async_trait]
pub trait BusReceiver: Send + Sync {
    /// Wait for the next message.
    async fn receive(&self) -> Result<Message, TransportError>;

    /// Settle a received message.
    async fn accept(&self, msg: &Message) -> Result<(), TransportError>;

    /// Detach the link.
    async fn close(&self);
}

/// Errors reported by transport implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connecting or opening the session failed
    #[error("dial error: {0}")]
    Connect(String),
    /// The session or link is no longer usable
    #[error("session closed")]
    Closed,
    /// Attaching a link failed
    #[error("link attach error for {address}: {reason}")]
    Attach {
        /// Link address
        address: String,
        /// Failure description
        reason: String,
    },
    /// Sending failed
    #[error("send error: {0}")]
    Send(String),
    /// Receiving failed
    #[error("receive error: {0}")]
    Receive(String),
    /// The broker address is malformed
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}
