//! Connection and session supervision.
//!
//! The container publishes the current session through a watch channel as a
//! [`SessionSlot`] tagged with a generation. Links cache the slot they last
//! used and report failures tagged with that generation; the supervisor only
//! tears down the session when the report matches the live generation, so
//! stale reports from links that have not yet rebound are ignored.

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::link::{Link, Receiver, Sender};
use crate::transport::{Connector, Session, TransportError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const REPORT_QUEUE: usize = 32;

/// Container configuration.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Identifier used in logs and as the bus client ID prefix
    pub container_id: String,
    /// Reconnect policy
    pub backoff: BackoffPolicy,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            container_id: format!("vanflow-{}", uuid::Uuid::new_v4().simple()),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Errors delivered to session error observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainerError {
    /// The session failed and will be rebuilt after `retry_in`
    #[error("session error: {source}")]
    Restart {
        /// Failure that ended the session
        source: TransportError,
        /// Delay before the next connect attempt
        retry_in: Duration,
    },
    /// The backoff policy is exhausted; the container has stopped
    #[error("error caused container to close: {0}")]
    Stopped(TransportError),
}

impl ContainerError {
    /// Delay before the next connect attempt, if the container will retry.
    #[must_use]
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            Self::Restart { retry_in, .. } => Some(*retry_in),
            Self::Stopped(_) => None,
        }
    }
}

/// The session links should use, tagged with its generation.
///
/// A slot with a new generation and no session means the container stopped.
#[derive(Clone, Default)]
pub(crate) struct SessionSlot {
    pub(crate) generation: u64,
    pub(crate) session: Option<Arc<dyn Session>>,
}

/// Failure reported by a link against the session generation it used.
#[derive(Debug)]
pub(crate) struct SessionFailure {
    pub(crate) generation: u64,
    pub(crate) error: TransportError,
}

/// Channels links use to report back to the supervisor.
#[derive(Clone)]
pub(crate) struct Reports {
    failures: mpsc::Sender<SessionFailure>,
    healthy: mpsc::Sender<u64>,
}

impl Reports {
    /// Report a failed link operation. Dropped when the queue is full; the
    /// supervisor only needs one report per generation.
    pub(crate) fn failure(&self, generation: u64, error: TransportError) {
        if self
            .failures
            .try_send(SessionFailure { generation, error })
            .is_err()
        {
            tracing::trace!(generation, "Session failure report dropped");
        }
    }

    /// Report a successful link operation.
    pub(crate) fn healthy(&self, generation: u64) {
        let _ = self.healthy.try_send(generation);
    }
}

type ErrorHandler = Arc<dyn Fn(&ContainerError) + Send + Sync>;

struct Inbox {
    failures: mpsc::Receiver<SessionFailure>,
    healthy: mpsc::Receiver<u64>,
}

struct Shared {
    config: ContainerConfig,
    connector: Arc<dyn Connector>,
    current: watch::Sender<SessionSlot>,
    reports: Reports,
    inbox: Mutex<Option<Inbox>>,
    handlers: Mutex<Vec<ErrorHandler>>,
}

impl Shared {
    fn notify(&self, err: &ContainerError) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(err);
        }
    }
}

/// Owner of one logical bus connection.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct Container {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("container_id", &self.shared.config.container_id)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Create a container that connects through `connector`.
    ///
    /// No connection is attempted until [`start`](Self::start).
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: ContainerConfig) -> Self {
        let (failures_tx, failures_rx) = mpsc::channel(REPORT_QUEUE);
        let (healthy_tx, healthy_rx) = mpsc::channel(REPORT_QUEUE);
        let (current, _) = watch::channel(SessionSlot::default());
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                current,
                reports: Reports {
                    failures: failures_tx,
                    healthy: healthy_tx,
                },
                inbox: Mutex::new(Some(Inbox {
                    failures: failures_rx,
                    healthy: healthy_rx,
                })),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Container identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.config.container_id
    }

    /// Generation of the current session; zero before the first connect.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.current.borrow().generation
    }

    /// Register an observer for session restarts and container shutdown.
    pub fn on_session_error<F>(&self, handler: F)
    where
        F: Fn(&ContainerError) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Start supervising the connection.
    ///
    /// Runs until `cancel` fires or the backoff policy gives up. Starting a
    /// container twice is a no-op.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let inbox = self
            .shared
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbox) = inbox else {
            tracing::warn!(container_id = %self.id(), "Container already started");
            return tokio::spawn(async {});
        };
        let span = tracing::info_span!("container", container_id = %self.id());
        let supervisor = Supervisor {
            shared: Arc::clone(&self.shared),
            cancel,
            inbox,
            generation: self.generation(),
            backoff: self.shared.config.backoff.start(),
            live: None,
        };
        tokio::spawn(supervisor.run().instrument(span))
    }

    /// Create a sender link for `address`.
    #[must_use]
    pub fn new_sender(&self, address: impl Into<String>) -> Sender {
        Sender::new(self.link(address.into(), 0))
    }

    /// Create a receiver link for `address` buffering up to `credit` messages.
    #[must_use]
    pub fn new_receiver(&self, address: impl Into<String>, credit: usize) -> Receiver {
        Receiver::new(self.link(address.into(), credit))
    }

    fn link(&self, address: String, credit: usize) -> Arc<Link> {
        Arc::new(Link::new(
            address,
            credit,
            self.shared.current.subscribe(),
            self.shared.reports.clone(),
        ))
    }
}

enum SessionEnd {
    Cancelled,
    Failed(TransportError),
}

struct Supervisor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    inbox: Inbox,
    generation: u64,
    backoff: ExponentialBackoff,
    live: Option<Arc<dyn Session>>,
}

impl Supervisor {
    async fn run(mut self) {
        let stopped = loop {
            let error = match self.run_session().await {
                SessionEnd::Cancelled => break None,
                SessionEnd::Failed(error) => error,
            };
            let Some(retry_in) = self.backoff.next_backoff() else {
                break Some(error);
            };
            tracing::warn!(
                error = %error,
                attempts = self.backoff.attempts(),
                retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                "Session failed, reconnecting"
            );
            self.shared.notify(&ContainerError::Restart {
                source: error,
                retry_in,
            });
            tokio::select! {
                () = self.cancel.cancelled() => break None,
                () = tokio::time::sleep(retry_in) => {}
            }
        };

        if let Some(session) = self.live.take() {
            session.close().await;
        }
        self.shared.current.send_replace(SessionSlot {
            generation: self.generation + 1,
            session: None,
        });
        match stopped {
            None => tracing::debug!("Container stopped"),
            Some(error) => {
                tracing::error!(error = %error, "Container giving up after repeated session failures");
                self.shared.notify(&ContainerError::Stopped(error));
            }
        }
    }

    async fn run_session(&mut self) -> SessionEnd {
        let connected = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Cancelled,
            connected = self.shared.connector.connect() => connected,
        };
        let session = match connected {
            Ok(session) => session,
            Err(error) => return SessionEnd::Failed(error),
        };

        self.generation += 1;
        let generation = self.generation;
        self.shared.current.send_replace(SessionSlot {
            generation,
            session: Some(Arc::clone(&session)),
        });
        if let Some(previous) = self.live.replace(session) {
            previous.close().await;
        }
        tracing::info!(generation, "Session established");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                Some(healthy) = self.inbox.healthy.recv() => {
                    if healthy == generation {
                        self.backoff.reset();
                    }
                }
                Some(failure) = self.inbox.failures.recv() => {
                    if failure.generation == generation {
                        return SessionEnd::Failed(failure.error);
                    }
                    tracing::trace!(
                        reported = failure.generation,
                        generation,
                        "Ignoring failure from stale session"
                    );
                }
            }
        }
    }
}
