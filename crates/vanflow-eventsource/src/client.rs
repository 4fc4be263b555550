//! Client for one remote event source.
//!
//! A client listens on any number of the source's addresses and dispatches
//! decoded heartbeats and records to registered handlers. Handlers run on the
//! receive task that decoded the message; the handler list is copied before
//! each dispatch so handlers may register or remove handlers.

use crate::info::Info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use vanflow_proto::addresses::{FLOWS_SUFFIX, HEARTBEATS_SUFFIX, LOGS_SUFFIX};
use vanflow_proto::{DecodedMessage, FlushMessage, HeartbeatMessage, RecordMessage};
use vanflow_session::{Container, LinkError, Receiver};

const DEFAULT_CREDIT: usize = 256;

type RecordHandler = Arc<dyn Fn(&RecordMessage) + Send + Sync>;
type HeartbeatHandler = Arc<dyn Fn(&HeartbeatMessage) + Send + Sync>;

/// Handle identifying a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Client options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Source to listen to
    pub source: Info,
    /// Messages buffered per listen address
    pub credit: usize,
}

impl ClientOptions {
    /// Options for listening to `source`.
    #[must_use]
    pub fn new(source: Info) -> Self {
        Self {
            source,
            credit: DEFAULT_CREDIT,
        }
    }
}

/// Address of a source a client can listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAddress {
    /// The source address itself
    Primary,
    /// The `.heartbeats` alternate
    Heartbeats,
    /// The `.flows` alternate
    Flows,
    /// The `.logs` alternate
    Logs,
    /// Any other address
    Custom(String),
}

impl SourceAddress {
    /// Resolve against `source`.
    #[must_use]
    pub fn resolve(&self, source: &Info) -> String {
        match self {
            Self::Primary => source.address.clone(),
            Self::Heartbeats => format!("{}{HEARTBEATS_SUFFIX}", source.address),
            Self::Flows => format!("{}{FLOWS_SUFFIX}", source.address),
            Self::Logs => format!("{}{LOGS_SUFFIX}", source.address),
            Self::Custom(address) => address.clone(),
        }
    }
}

/// Errors for client operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The client was closed
    #[error("client closed")]
    Closed,
    /// Cancelled before the source sent anything
    #[error("timed out waiting for first message from {0}")]
    Timeout(String),
    /// Sending a flush request failed
    #[error("flush send error: {0}")]
    Flush(#[source] LinkError),
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    records: Vec<(HandlerId, RecordHandler)>,
    heartbeats: Vec<(HandlerId, HeartbeatHandler)>,
}

impl Handlers {
    fn next_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

struct Inner {
    container: Container,
    options: ClientOptions,
    handlers: Mutex<Handlers>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Inner {
    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, msg: DecodedMessage) {
        match msg {
            DecodedMessage::Record(record) => {
                let handlers: Vec<RecordHandler> =
                    self.handlers().records.iter().map(|(_, h)| Arc::clone(h)).collect();
                for handler in handlers {
                    handler(&record);
                }
            }
            DecodedMessage::Heartbeat(heartbeat) => {
                let handlers: Vec<HeartbeatHandler> =
                    self.handlers().heartbeats.iter().map(|(_, h)| Arc::clone(h)).collect();
                for handler in handlers {
                    handler(&heartbeat);
                }
            }
            DecodedMessage::Beacon(_) | DecodedMessage::Flush(_) => {
                tracing::debug!("Ignoring message not meant for clients");
            }
        }
    }

    async fn receive(&self, receiver: &Receiver) {
        loop {
            let msg = match receiver.next(&self.cancel).await {
                Ok(msg) => msg,
                Err(err) => {
                    if !matches!(err, LinkError::Cancelled) {
                        tracing::debug!(error = %err, "Client receive loop ending");
                    }
                    return;
                }
            };
            if let Err(err) = receiver.accept(&self.cancel, &msg).await {
                tracing::debug!(error = %err, "Failed to settle message");
            }
            match vanflow_proto::decode(&msg) {
                Ok(decoded) => self.dispatch(decoded),
                Err(err) => {
                    tracing::warn!(address = receiver.address(), error = %err, "Skipping malformed message");
                }
            }
        }
    }
}

/// Client for one remote event source. Cloning is cheap.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("source", &self.inner.options.source.id)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client. Nothing is received until [`listen`](Self::listen).
    #[must_use]
    pub fn new(container: Container, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                container,
                options,
                handlers: Mutex::new(Handlers::default()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The source this client listens to.
    #[must_use]
    pub fn source(&self) -> &Info {
        &self.inner.options.source
    }

    /// Register a handler for record messages.
    pub fn on_record<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&RecordMessage) + Send + Sync + 'static,
    {
        let mut handlers = self.inner.handlers();
        let id = handlers.next_id();
        handlers.records.push((id, Arc::new(handler)));
        id
    }

    /// Register a handler for heartbeat messages.
    pub fn on_heartbeat<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&HeartbeatMessage) + Send + Sync + 'static,
    {
        let mut handlers = self.inner.handlers();
        let id = handlers.next_id();
        handlers.heartbeats.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers();
        let before = handlers.records.len() + handlers.heartbeats.len();
        handlers.records.retain(|(handler, _)| *handler != id);
        handlers.heartbeats.retain(|(handler, _)| *handler != id);
        before != handlers.records.len() + handlers.heartbeats.len()
    }

    /// Start receiving from `address` until `cancel` fires or the client is
    /// closed. Every call starts an independent receive loop.
    ///
    /// # Errors
    ///
    /// Returns error if the client is closed.
    pub fn listen(&self, cancel: &CancellationToken, address: SourceAddress) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let resolved = address.resolve(&self.inner.options.source);
        let receiver = self
            .inner
            .container
            .new_receiver(resolved.clone(), self.inner.options.credit);
        let inner = Arc::clone(&self.inner);
        let caller = cancel.clone();
        let span = tracing::debug_span!(
            "client",
            source = %self.inner.options.source.id,
            address = %resolved
        );
        self.inner.tracker.spawn(
            async move {
                tokio::select! {
                    () = caller.cancelled() => {}
                    () = inner.receive(&receiver) => {}
                }
                receiver.close().await;
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Send a flush request to the source's direct address.
    ///
    /// # Errors
    ///
    /// Returns error if the send fails or `cancel` fires first.
    pub async fn send_flush(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let direct = &self.inner.options.source.direct;
        let sender = self.inner.container.new_sender(direct.clone());
        let sent = sender
            .send(cancel, FlushMessage::new(direct.clone()).encode())
            .await;
        sender.close().await;
        sent.map_err(ClientError::Flush)?;
        tracing::debug!(source = %self.inner.options.source.id, "Flush request sent");
        Ok(())
    }

    /// Stop every receive loop and wait for them to finish. Safe to call
    /// more than once.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.cancel.cancel();
            self.inner.tracker.close();
        }
        self.inner.tracker.wait().await;
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Send exactly one flush request once the first heartbeat or record from
/// the client's source arrives.
///
/// # Errors
///
/// Returns [`ClientError::Timeout`] if `cancel` fires before anything
/// arrives, or the flush send error.
pub async fn flush_on_first_message(cancel: &CancellationToken, client: &Client) -> Result<(), ClientError> {
    let (tx, mut rx) = mpsc::channel::<()>(1);
    let on_record = {
        let tx = tx.clone();
        client.on_record(move |_| {
            let _ = tx.try_send(());
        })
    };
    let on_heartbeat = client.on_heartbeat(move |_| {
        let _ = tx.try_send(());
    });

    let first = tokio::select! {
        () = cancel.cancelled() => None,
        first = rx.recv() => first,
    };
    client.remove_handler(on_record);
    client.remove_handler(on_heartbeat);

    if first.is_none() {
        return Err(ClientError::Timeout(client.source().id.clone()));
    }
    client.send_flush(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio_test::assert_ok;
    use vanflow_session::{BackoffPolicy, ContainerConfig, MemoryBus};

    fn container(bus: &MemoryBus, cancel: &CancellationToken) -> Container {
        let container = Container::new(
            Arc::new(bus.clone()),
            ContainerConfig {
                container_id: "client-test".into(),
                backoff: BackoffPolicy::constant(Duration::from_millis(5)),
            },
        );
        container.start(cancel.clone());
        container
    }

    #[test]
    fn source_addresses() {
        let info = Info::new("abc", "ROUTER");
        assert_eq!(SourceAddress::Primary.resolve(&info), "mc/sfe.abc");
        assert_eq!(SourceAddress::Heartbeats.resolve(&info), "mc/sfe.abc.heartbeats");
        assert_eq!(SourceAddress::Flows.resolve(&info), "mc/sfe.abc.flows");
        assert_eq!(SourceAddress::Logs.resolve(&info), "mc/sfe.abc.logs");
        assert_eq!(SourceAddress::Custom("x".into()).resolve(&info), "x");
    }

    #[tokio::test]
    async fn handlers_are_removable() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let client = Client::new(container(&bus, &cancel), ClientOptions::new(Info::new("a", "ROUTER")));
        let id = client.on_record(|_| {});
        let other = client.on_heartbeat(|_| {});
        assert!(client.remove_handler(id));
        assert!(!client.remove_handler(id));
        assert!(client.remove_handler(other));
        cancel.cancel();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_listen() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let client = Client::new(container(&bus, &cancel), ClientOptions::new(Info::new("a", "ROUTER")));
        client.listen(&cancel, SourceAddress::Primary).unwrap();

        assert_ok!(tokio::time::timeout(Duration::from_secs(1), client.close()).await);
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), client.close()).await);
        assert!(client.is_closed());
        assert_eq!(client.listen(&cancel, SourceAddress::Primary), Err(ClientError::Closed));
        cancel.cancel();
    }

    #[tokio::test]
    async fn flush_on_first_message_times_out() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let client = Client::new(container(&bus, &cancel), ClientOptions::new(Info::new("quiet", "ROUTER")));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            client.on_heartbeat(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let op = CancellationToken::new();
        let waiter = {
            let op = op.clone();
            let client = client.clone();
            tokio::spawn(async move { flush_on_first_message(&op, &client).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        op.cancel();
        let result = waiter.await.unwrap();
        assert_eq!(result, Err(ClientError::Timeout("quiet".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }
}
