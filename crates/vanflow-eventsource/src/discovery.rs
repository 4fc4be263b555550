//! Event source discovery.
//!
//! [`Discovery::run`] listens for beacons and keeps a table of known
//! sources. A source stays known until it is forgotten explicitly or a watch
//! started with [`Discovery::new_watch_client`] sees no heartbeat or record
//! from it for longer than the watch timeout.
//!
//! Discovered and forgotten events are queued in table order and delivered
//! to the [`DiscoveryHandlers`] from a task of their own, so handlers may
//! call back into the discovery.

use crate::client::Client;
use crate::info::Info;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vanflow_proto::{DecodedMessage, BEACON_ADDRESS};
use vanflow_session::{Container, LinkError};

const BEACON_CREDIT: usize = 256;

/// Discovery options.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Address beacons are received on
    pub beacon_address: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            beacon_address: BEACON_ADDRESS.to_string(),
        }
    }
}

type InfoHandler = Box<dyn Fn(Info) + Send + Sync>;

/// Callbacks for discovery events.
#[derive(Default)]
pub struct DiscoveryHandlers {
    discovered: Option<InfoHandler>,
    forgotten: Option<InfoHandler>,
}

impl std::fmt::Debug for DiscoveryHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryHandlers")
            .field("discovered", &self.discovered.is_some())
            .field("forgotten", &self.forgotten.is_some())
            .finish()
    }
}

impl DiscoveryHandlers {
    /// Called once for every newly known source.
    #[must_use]
    pub fn on_discovered<F>(mut self, handler: F) -> Self
    where
        F: Fn(Info) + Send + Sync + 'static,
    {
        self.discovered = Some(Box::new(handler));
        self
    }

    /// Called once for every forgotten source.
    #[must_use]
    pub fn on_forgotten<F>(mut self, handler: F) -> Self
    where
        F: Fn(Info) + Send + Sync + 'static,
    {
        self.forgotten = Some(Box::new(handler));
        self
    }

    fn handle(&self, event: Event) {
        match event {
            Event::Discovered(info) => {
                if let Some(handler) = &self.discovered {
                    handler(info);
                }
            }
            Event::Forgotten(info) => {
                if let Some(handler) = &self.forgotten {
                    handler(info);
                }
            }
        }
    }
}

/// Errors for discovery operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// The watched source is not known
    #[error("unknown event source {0}")]
    UnknownSource(String),
    /// [`Discovery::run`] was already called
    #[error("discovery is already running")]
    AlreadyRunning,
    /// The beacon receiver failed permanently
    #[error("discovery error receiving beacon messages: {0}")]
    Receive(#[source] LinkError),
}

enum Event {
    Discovered(Info),
    Forgotten(Info),
}

struct Inner {
    container: Container,
    beacon_address: String,
    state: Mutex<HashMap<String, Info>>,
    events: mpsc::UnboundedSender<Event>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

/// Table of known event sources. Cloning is cheap; clones share the table.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("beacon_address", &self.inner.beacon_address)
            .field("sources", &self.state().len())
            .finish_non_exhaustive()
    }
}

impl Discovery {
    /// Create a discovery receiving beacons through `container`.
    #[must_use]
    pub fn new(container: Container, options: DiscoveryOptions) -> Self {
        let (events, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                container,
                beacon_address: options.beacon_address,
                state: Mutex::new(HashMap::new()),
                events,
                pending: Mutex::new(Some(pending)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, Info>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        // The receiver lives until the discovery is dropped.
        let _ = self.inner.events.send(event);
    }

    /// Receive beacons until `cancel` fires, delivering events to `handlers`.
    ///
    /// # Errors
    ///
    /// Returns error if discovery is already running or the beacon receiver
    /// fails permanently.
    pub async fn run(&self, cancel: &CancellationToken, handlers: DiscoveryHandlers) -> Result<(), DiscoveryError> {
        let pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut events) = pending else {
            return Err(DiscoveryError::AlreadyRunning);
        };

        let span = tracing::info_span!("discovery", component = "vanflow.eventsource.discovery");
        let dispatch_cancel = cancel.child_token();
        let dispatch = {
            let cancel = dispatch_cancel.clone();
            tokio::spawn(
                async move {
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            event = events.recv() => match event {
                                Some(event) => handlers.handle(event),
                                None => return,
                            },
                        }
                    }
                }
                .instrument(span.clone()),
            )
        };

        let result = self.receive_beacons(cancel).instrument(span).await;
        dispatch_cancel.cancel();
        if let Err(err) = dispatch.await {
            tracing::error!(error = %err, "Discovery event dispatch panicked");
        }
        result
    }

    async fn receive_beacons(&self, cancel: &CancellationToken) -> Result<(), DiscoveryError> {
        let receiver = self
            .inner
            .container
            .new_receiver(self.inner.beacon_address.clone(), BEACON_CREDIT);
        tracing::info!(address = %self.inner.beacon_address, "Discovery started");
        let result = loop {
            let msg = match receiver.next(cancel).await {
                Ok(msg) => msg,
                Err(LinkError::Cancelled) => break Ok(()),
                Err(err) => break Err(DiscoveryError::Receive(err)),
            };
            if let Err(err) = receiver.accept(cancel, &msg).await {
                tracing::error!(error = %err, "Discovery failed to settle beacon");
            }
            match vanflow_proto::decode(&msg) {
                Ok(DecodedMessage::Beacon(beacon)) => self.observe(&Info::from_beacon(&beacon, Utc::now())),
                Ok(_) => {
                    tracing::info!(subject = ?msg.subject(), to = ?msg.to(), "Received non-beacon on beacon address");
                }
                Err(err) => tracing::warn!(error = %err, "Skipping malformed beacon"),
            }
        };
        receiver.close().await;
        result
    }

    /// Record a beacon: refresh a known source or add a new one.
    fn observe(&self, seen: &Info) {
        let mut state = self.state();
        match state.get_mut(&seen.id) {
            Some(known) => known.last_seen = seen.last_seen,
            None => {
                tracing::info!(source = %seen.id, source_type = %seen.source_type, "Discovered event source");
                state.insert(seen.id.clone(), seen.clone());
                self.emit(Event::Discovered(seen.clone()));
            }
        }
    }

    /// Source with ID `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Info> {
        self.state().get(id).cloned()
    }

    /// Add a source unless one with the same ID is known. Returns whether it
    /// was added.
    pub fn add(&self, info: Info) -> bool {
        let mut state = self.state();
        if state.contains_key(&info.id) {
            return false;
        }
        state.insert(info.id.clone(), info.clone());
        self.emit(Event::Discovered(info));
        true
    }

    /// Forget a source. Returns whether it was known.
    pub fn forget(&self, id: &str) -> bool {
        let mut state = self.state();
        let Some(info) = state.remove(id) else {
            return false;
        };
        tracing::info!(source = %id, "Forgetting event source");
        self.emit(Event::Forgotten(info));
        true
    }

    /// Every known source, in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<Info> {
        self.state().values().cloned().collect()
    }

    fn last_seen(&self, id: &str, latest: DateTime<Utc>) {
        if let Some(info) = self.state().get_mut(id) {
            if latest > info.last_seen {
                info.last_seen = latest;
            }
        }
    }

    /// Watch a known source through `config.client`, keeping its last seen
    /// time current and forgetting it once it goes quiet. The client is
    /// closed when the watch ends.
    ///
    /// # Errors
    ///
    /// Returns error if the source is not known.
    pub fn new_watch_client(
        &self,
        cancel: &CancellationToken,
        config: WatchConfig,
    ) -> Result<JoinHandle<()>, DiscoveryError> {
        if self.get(&config.id).is_none() {
            return Err(DiscoveryError::UnknownSource(config.id));
        }
        let observed = Arc::new(AtomicI64::new(0));
        let handlers = {
            let on_record = Arc::clone(&observed);
            let on_heartbeat = Arc::clone(&observed);
            [
                config.client.on_record(move |_| {
                    on_record.store(Utc::now().timestamp_micros(), Ordering::Release);
                }),
                config.client.on_heartbeat(move |_| {
                    on_heartbeat.store(Utc::now().timestamp_micros(), Ordering::Release);
                }),
            ]
        };
        let watch = Watch {
            discovery: self.clone(),
            observed,
            config,
        };
        let span = tracing::debug_span!("watch", source = %watch.config.id);
        let cancel = cancel.clone();
        Ok(tokio::spawn(
            async move {
                watch.run(&cancel).await;
                for handler in handlers {
                    watch.config.client.remove_handler(handler);
                }
                watch.config.client.close().await;
            }
            .instrument(span),
        ))
    }
}

/// Watch settings.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Client listening to the watched source
    pub client: Client,
    /// ID of the watched source
    pub id: String,
    /// Inactivity after which the source is forgotten (`None`: never)
    pub timeout: Option<Duration>,
    /// Extra time allowed before the first activity
    pub grace_period: Duration,
    /// How often the observed activity is committed to the table
    pub discovery_update_interval: Duration,
}

impl WatchConfig {
    /// Watch source `id` through `client` without a timeout.
    #[must_use]
    pub fn new(client: Client, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
            timeout: None,
            grace_period: Duration::ZERO,
            discovery_update_interval: Duration::from_secs(1),
        }
    }
}

struct Watch {
    discovery: Discovery,
    observed: Arc<AtomicI64>,
    config: WatchConfig,
}

impl Watch {
    /// Activity newer than `prev`, in microseconds since the epoch.
    fn advance(&self, prev: i64) -> Option<i64> {
        let current = self.observed.load(Ordering::Acquire);
        (current > prev).then_some(current)
    }

    fn commit(&self, micros: i64) {
        if let Some(at) = DateTime::from_timestamp_micros(micros) {
            self.discovery.last_seen(&self.config.id, at);
        }
    }

    async fn run(&self, cancel: &CancellationToken) {
        let mut timer: Option<Pin<Box<Sleep>>> = self
            .config
            .timeout
            .map(|timeout| Box::pin(tokio::time::sleep(self.config.grace_period + timeout)));
        let update = if self.config.discovery_update_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.config.discovery_update_interval
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + update, update);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut prev = self.advance(0).unwrap_or(0);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = expired(&mut timer) => {
                    let Some(next) = self.advance(prev) else {
                        tracing::info!(source = %self.config.id, "Event source timed out");
                        self.discovery.forget(&self.config.id);
                        return;
                    };
                    self.commit(next);
                    self.rearm(&mut timer);
                    prev = next;
                }
                _ = ticker.tick() => {
                    if let Some(next) = self.advance(prev) {
                        self.commit(next);
                        self.rearm(&mut timer);
                        prev = next;
                    }
                }
            }
        }
    }

    fn rearm(&self, timer: &mut Option<Pin<Box<Sleep>>>) {
        if let (Some(timer), Some(timeout)) = (timer.as_mut(), self.config.timeout) {
            timer.as_mut().reset(Instant::now() + timeout);
        }
    }
}

async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
