//! Event source manager.
//!
//! Runs the publishing side of an event source over one container:
//!
//! 1. **Keepalive**: a beacon every `beacon_interval` and a heartbeat every
//!    `heartbeat_interval`
//! 2. **Flush listener**: queues flush requests arriving on the direct address
//! 3. **Serve**: answers queued flushes with a dump of every store and turns
//!    published [`RecordUpdate`]s into minimal deltas
//! 4. **Send**: the single task that sends record messages, in queue order

use crate::info::Info;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use vanflow_core::{AttributeSet, Record, RecordRef, Registry, IDENTITY};
use vanflow_proto::addresses::HEARTBEATS_SUFFIX;
use vanflow_proto::{DecodedMessage, HeartbeatMessage, Message, MessageProps, RecordMessage, BEACON_ADDRESS};
use vanflow_session::{Container, LinkError, Receiver, Sender};
use vanflow_store::Store;

const FLUSH_QUEUE: usize = 8;
const CHANGE_QUEUE: usize = 256;
const SEND_QUEUE: usize = 256;
const FLUSH_CREDIT: usize = 256;
const FLUSH_DRAIN_LIMIT: usize = 2048;
const TOLERATED_HEARTBEAT_TIMEOUTS: u32 = 3;

/// Manager configuration.
#[derive(Clone)]
pub struct ManagerConfig {
    /// The local source being published
    pub source: Info,
    /// Stores dumped on flush, in order
    pub stores: Vec<Arc<dyn Store>>,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Beacon period
    pub beacon_interval: Duration,
    /// Address beacons are sent to
    pub beacon_address: String,
    /// Send heartbeats to the `.heartbeats` alternate of the source address
    pub use_alternate_heartbeat_address: bool,
    /// How long to wait after a flush request before dumping, absorbing
    /// further requests
    pub flush_delay: Duration,
    /// Maximum records per message when dumping (`0`: unbounded)
    pub flush_batch_size: usize,
    /// How long to wait for a full batch of updates before sending a partial one
    pub update_buffer_time: Duration,
    /// Maximum record updates per message
    pub update_batch_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            source: Info::default(),
            stores: Vec::new(),
            heartbeat_interval: Duration::from_secs(2),
            beacon_interval: Duration::from_secs(10),
            beacon_address: BEACON_ADDRESS.to_string(),
            use_alternate_heartbeat_address: false,
            flush_delay: Duration::ZERO,
            flush_batch_size: 0,
            update_buffer_time: Duration::ZERO,
            update_batch_size: 1,
        }
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("source", &self.source)
            .field("stores", &self.stores.len())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("beacon_interval", &self.beacon_interval)
            .field("beacon_address", &self.beacon_address)
            .field("use_alternate_heartbeat_address", &self.use_alternate_heartbeat_address)
            .field("flush_delay", &self.flush_delay)
            .field("flush_batch_size", &self.flush_batch_size)
            .field("update_buffer_time", &self.update_buffer_time)
            .field("update_batch_size", &self.update_batch_size)
            .finish()
    }
}

/// A change to a published record.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    /// Previous snapshot; `None` for a new record
    pub prev: Option<RecordRef>,
    /// Current snapshot
    pub curr: RecordRef,
}

/// Errors for manager operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// [`Manager::run`] was already called
    #[error("manager is already running")]
    AlreadyRunning,
    /// The manager is no longer accepting updates
    #[error("manager stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("send timed out")]
    Timeout,
    #[error(transparent)]
    Link(#[from] LinkError),
}

struct Queues {
    flush: mpsc::Receiver<()>,
    change: mpsc::Receiver<RecordUpdate>,
    send: mpsc::Receiver<RecordMessage>,
}

/// Publisher for one local event source.
pub struct Manager {
    config: ManagerConfig,
    container: Container,
    registry: &'static Registry,
    flush_tx: mpsc::Sender<()>,
    change_tx: mpsc::Sender<RecordUpdate>,
    send_tx: mpsc::Sender<RecordMessage>,
    queues: Mutex<Option<Queues>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("source", &self.config.source.id)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Create a manager publishing through `container`.
    #[must_use]
    pub fn new(container: Container, config: ManagerConfig) -> Self {
        let (flush_tx, flush) = mpsc::channel(FLUSH_QUEUE);
        let (change_tx, change) = mpsc::channel(CHANGE_QUEUE);
        let (send_tx, send) = mpsc::channel(SEND_QUEUE);
        Self {
            config,
            container,
            registry: Registry::global(),
            flush_tx,
            change_tx,
            send_tx,
            queues: Mutex::new(Some(Queues { flush, change, send })),
        }
    }

    /// The source being published.
    #[must_use]
    pub fn source(&self) -> &Info {
        &self.config.source
    }

    /// Queue a record change for publishing. Waits while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns error if the manager has stopped.
    pub async fn publish_update(&self, update: RecordUpdate) -> Result<(), ManagerError> {
        self.change_tx.send(update).await.map_err(|_| ManagerError::Stopped)
    }

    /// Run every manager loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns error if the manager is already running.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ManagerError> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(Queues { flush, change, send }) = queues else {
            return Err(ManagerError::AlreadyRunning);
        };
        let span = tracing::info_span!(
            "manager",
            component = "vanflow.eventsource.manager",
            instance = %self.config.source.id
        );

        let tracker = TaskTracker::new();
        let loops = cancel.child_token();
        tracker.spawn(
            send_records(
                self.container.new_sender(self.config.source.address.clone()),
                send,
                loops.clone(),
            )
            .instrument(span.clone()),
        );
        tracker.spawn(
            listen_flushes(
                self.container
                    .new_receiver(self.config.source.direct.clone(), FLUSH_CREDIT),
                self.flush_tx.clone(),
                loops.clone(),
            )
            .instrument(span.clone()),
        );
        tracker.spawn(
            Keepalive::new(&self.config, &self.container)
                .run(loops.clone())
                .instrument(span.clone()),
        );
        tracker.close();

        tracing::info!(parent: &span, address = %self.config.source.address, "Manager started");
        self.serve(&loops, flush, change).instrument(span.clone()).await;
        loops.cancel();
        tracker.wait().await;
        tracing::info!(parent: &span, "Manager stopped");
        Ok(())
    }

    async fn serve(
        &self,
        cancel: &CancellationToken,
        mut flush: mpsc::Receiver<()>,
        mut change: mpsc::Receiver<RecordUpdate>,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                Some(update) = change.recv() => {
                    if !self.serve_updates(cancel, update, &mut change).await {
                        return;
                    }
                }
                Some(()) = flush.recv() => {
                    if !self.serve_flush(cancel, &mut flush).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false once cancelled.
    async fn serve_updates(
        &self,
        cancel: &CancellationToken,
        first: RecordUpdate,
        change: &mut mpsc::Receiver<RecordUpdate>,
    ) -> bool {
        let mut buffer = vec![first];
        let batch = self.config.update_batch_size;
        if !self.config.update_buffer_time.is_zero() && batch > 1 {
            let deadline = Instant::now() + self.config.update_buffer_time;
            buffer.extend(next_n(cancel, change, batch - 1, deadline).await);
            if cancel.is_cancelled() {
                return false;
            }
        }

        let records: Vec<RecordRef> = buffer.iter().filter_map(|update| self.diff_record(update)).collect();
        if records.is_empty() {
            tracing::debug!(record_count = buffer.len(), "Record changes buffered but none were changed");
            return true;
        }
        self.enqueue(cancel, RecordMessage::new(self.config.source.address.clone(), records))
            .await
    }

    /// Returns false once cancelled.
    async fn serve_flush(&self, cancel: &CancellationToken, flush: &mut mpsc::Receiver<()>) -> bool {
        if !self.config.flush_delay.is_zero() {
            let deadline = Instant::now() + self.config.flush_delay;
            let absorbed = next_n(cancel, flush, FLUSH_DRAIN_LIMIT, deadline).await;
            if cancel.is_cancelled() {
                return false;
            }
            tracing::debug!(absorbed = absorbed.len(), "Flush delay elapsed");
        }
        tracing::info!(source = %self.config.source.id, "Servicing flush");
        for store in &self.config.stores {
            let entries = store.list();
            let size = match self.config.flush_batch_size {
                0 => entries.len().max(1),
                size => size,
            };
            for batch in entries.chunks(size) {
                let records = batch.iter().map(|entry| Arc::clone(&entry.record)).collect();
                let msg = RecordMessage::new(self.config.source.address.clone(), records);
                if !self.enqueue(cancel, msg).await {
                    return false;
                }
            }
        }
        true
    }

    async fn enqueue(&self, cancel: &CancellationToken, msg: RecordMessage) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            sent = self.send_tx.send(msg) => sent.is_ok(),
        }
    }

    /// Reduce an update to the attributes that changed, keeping the type and
    /// identity. Returns `None` when nothing changed or encoding fails.
    fn diff_record(&self, update: &RecordUpdate) -> Option<RecordRef> {
        let Some(prev) = &update.prev else {
            return Some(Arc::clone(&update.curr));
        };
        let prev = self.encode_logged(prev.as_ref(), "prev")?;
        let next = self.encode_logged(update.curr.as_ref(), "curr")?;
        let delta = diff_attributes(&prev, &next)?;
        match self.registry.decode(&delta) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::error!(error = %err, "Record update diff error decoding delta");
                None
            }
        }
    }

    fn encode_logged(&self, record: &dyn Record, which: &str) -> Option<AttributeSet> {
        match self.registry.encode(record) {
            Ok(attrs) => Some(attrs),
            Err(err) => {
                tracing::error!(error = %err, which, "Record update diff error encoding");
                None
            }
        }
    }
}

/// Attributes of `next` that differ from `prev`, plus the type and identity.
/// `None` when nothing differs.
fn diff_attributes(prev: &AttributeSet, next: &AttributeSet) -> Option<AttributeSet> {
    let mut changed = false;
    let mut delta = AttributeSet::new();
    for (codepoint, value) in next {
        if prev.get(codepoint) != Some(value) {
            changed = true;
            delta.insert(*codepoint, value.clone());
        } else if *codepoint <= IDENTITY {
            delta.insert(*codepoint, value.clone());
        }
    }
    changed.then_some(delta)
}

/// Receive up to `n` items from `rx` before `deadline` or cancellation.
async fn next_n<T>(
    cancel: &CancellationToken,
    rx: &mut mpsc::Receiver<T>,
    n: usize,
    deadline: Instant,
) -> Vec<T> {
    let mut out = Vec::new();
    if n == 0 {
        return out;
    }
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return out,
            () = &mut sleep => return out,
            item = rx.recv() => match item {
                Some(item) => {
                    out.push(item);
                    if out.len() == n {
                        return out;
                    }
                }
                None => return out,
            },
        }
    }
}

/// Send with a deadline. The send is abandoned when `timeout` elapses.
async fn send_with_timeout(
    cancel: &CancellationToken,
    timeout: Duration,
    sender: &Sender,
    msg: Message,
) -> Result<(), SendError> {
    match tokio::time::timeout(timeout, sender.send(cancel, msg)).await {
        Ok(sent) => Ok(sent?),
        Err(_) => Err(SendError::Timeout),
    }
}

async fn send_records(sender: Sender, mut queue: mpsc::Receiver<RecordMessage>, cancel: CancellationToken) {
    loop {
        let record = tokio::select! {
            () = cancel.cancelled() => break,
            record = queue.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        let msg = match record.encode() {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(error = %err, "Skipping record message after encoding error");
                continue;
            }
        };
        match sender.send(&cancel, msg).await {
            Ok(()) => tracing::info!(record_count = record.records.len(), "Record message sent"),
            Err(LinkError::Cancelled) => break,
            Err(err) => tracing::error!(error = %err, "Error sending event source record"),
        }
    }
    sender.close().await;
}

async fn listen_flushes(receiver: Receiver, queue: mpsc::Sender<()>, cancel: CancellationToken) {
    loop {
        let msg = match receiver.next(&cancel).await {
            Ok(msg) => msg,
            Err(LinkError::Cancelled) => break,
            Err(err) => {
                tracing::error!(error = %err, "Flush receive error");
                break;
            }
        };
        if let Err(err) = receiver.accept(&cancel, &msg).await {
            tracing::debug!(error = %err, "Failed to settle flush request");
        }
        match vanflow_proto::decode(&msg) {
            Ok(DecodedMessage::Flush(_)) => {}
            Ok(_) => {
                tracing::debug!(subject = ?msg.subject(), "Ignoring non-flush on direct address");
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed flush request");
                continue;
            }
        }
        if queue.try_send(()).is_err() {
            tracing::debug!("Flush queue full, dropping request");
        }
    }
    receiver.close().await;
}

struct Keepalive {
    beacon: Message,
    heartbeat: HeartbeatMessage,
    beacon_interval: Duration,
    heartbeat_interval: Duration,
    beacon_sender: Sender,
    heartbeat_sender: Sender,
}

impl Keepalive {
    fn new(config: &ManagerConfig, container: &Container) -> Self {
        let mut beacon = config.source.beacon();
        beacon.props.to.clone_from(&config.beacon_address);
        let heartbeat_address = if config.use_alternate_heartbeat_address {
            format!("{}{HEARTBEATS_SUFFIX}", config.source.address)
        } else {
            config.source.address.clone()
        };
        let heartbeat = HeartbeatMessage {
            props: MessageProps {
                to: heartbeat_address.clone(),
                ..MessageProps::default()
            },
            identity: config.source.id.clone(),
            version: config.source.version,
            now: 0,
        };
        let beacon_interval = non_zero_or(config.beacon_interval, Duration::from_secs(10));
        let heartbeat_interval = non_zero_or(config.heartbeat_interval, Duration::from_secs(2));
        Self {
            beacon: beacon.encode(),
            heartbeat,
            beacon_interval,
            heartbeat_interval,
            beacon_sender: container.new_sender(config.beacon_address.clone()),
            heartbeat_sender: container.new_sender(heartbeat_address),
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        self.keepalive(&cancel).await;
        self.beacon_sender.close().await;
        self.heartbeat_sender.close().await;
    }

    async fn keepalive(&mut self, cancel: &CancellationToken) {
        // The first beacon is retried until it goes out.
        loop {
            match send_with_timeout(cancel, self.beacon_interval, &self.beacon_sender, self.beacon.clone()).await {
                Ok(()) => break,
                Err(SendError::Link(err)) if err.is_terminal() => {
                    tracing::debug!(error = %err, "Initial beacon abandoned");
                    return;
                }
                Err(err) if cancel.is_cancelled() => {
                    tracing::debug!(error = %err, "Initial beacon abandoned");
                    return;
                }
                Err(err) => tracing::error!(error = %err, "Error sending initial beacon message"),
            }
        }
        tracing::debug!("Initial beacon sent");

        let delivery_timeout = self.heartbeat_interval.min(self.beacon_interval);
        let mut beacons = tokio::time::interval_at(Instant::now() + self.beacon_interval, self.beacon_interval);
        beacons.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeats =
            tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut heartbeat_timeouts = 0;
        let mut first_heartbeat_sent = false;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = beacons.tick() => {
                    let sent = send_with_timeout(cancel, delivery_timeout, &self.beacon_sender, self.beacon.clone()).await;
                    if let Err(err) = sent {
                        if cancel.is_cancelled() {
                            return;
                        }
                        tracing::error!(error = %err, "Error sending event source beacon");
                    }
                }
                _ = heartbeats.tick() => {
                    self.heartbeat.now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
                    let sent = send_with_timeout(cancel, delivery_timeout, &self.heartbeat_sender, self.heartbeat.encode()).await;
                    match sent {
                        Ok(()) => {}
                        Err(_) if cancel.is_cancelled() => return,
                        Err(SendError::Timeout)
                            if !first_heartbeat_sent && heartbeat_timeouts < TOLERATED_HEARTBEAT_TIMEOUTS =>
                        {
                            heartbeat_timeouts += 1;
                            tracing::info!("Initial heartbeat message send timed out");
                            continue;
                        }
                        Err(err) => tracing::error!(
                            error = %err,
                            prior_success = first_heartbeat_sent,
                            timeouts = heartbeat_timeouts,
                            "Error sending event source heartbeat"
                        ),
                    }
                    first_heartbeat_sent = true;
                }
            }
        }
    }
}

fn non_zero_or(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vanflow_core::{RouterRecord, Value, TYPE_OF_RECORD};

    fn attrs(pairs: &[(u32, Value)]) -> AttributeSet {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn identical_attributes_have_no_delta() {
        let set = attrs(&[(0, Value::Uint32(1)), (1, Value::from("r")), (30, Value::from("a"))]);
        assert_eq!(diff_attributes(&set, &set), None);
    }

    #[test]
    fn delta_keeps_type_and_identity() {
        let prev = attrs(&[(0, Value::Uint32(1)), (1, Value::from("r")), (30, Value::from("a")), (12, Value::from("ns"))]);
        let next = attrs(&[(0, Value::Uint32(1)), (1, Value::from("r")), (30, Value::from("b")), (12, Value::from("ns"))]);
        let delta = diff_attributes(&prev, &next).unwrap();
        assert_eq!(
            delta,
            attrs(&[(TYPE_OF_RECORD, Value::Uint32(1)), (IDENTITY, Value::from("r")), (30, Value::from("b"))])
        );
    }

    #[test]
    fn new_attribute_is_a_change() {
        let prev = attrs(&[(0, Value::Uint32(1)), (1, Value::from("r"))]);
        let next = attrs(&[(0, Value::Uint32(1)), (1, Value::from("r")), (12, Value::from("ns"))]);
        assert_eq!(diff_attributes(&prev, &next).unwrap().len(), 3);
    }

    fn manager() -> Manager {
        let container = Container::new(
            Arc::new(vanflow_session::MemoryBus::new()),
            vanflow_session::ContainerConfig::default(),
        );
        Manager::new(container, ManagerConfig::default())
    }

    fn router(name: Option<&str>, namespace: Option<&str>) -> RecordRef {
        let mut record = RouterRecord::new("router-1");
        record.name = name.map(str::to_string);
        record.namespace = namespace.map(str::to_string);
        Arc::new(record)
    }

    #[test]
    fn new_record_is_sent_in_full() {
        let manager = manager();
        let curr = router(Some("a"), Some("ns"));
        let delta = manager
            .diff_record(&RecordUpdate {
                prev: None,
                curr: Arc::clone(&curr),
            })
            .unwrap();
        assert!(Registry::global().equivalent(delta.as_ref(), curr.as_ref()));
    }

    #[test]
    fn unchanged_record_is_dropped() {
        let manager = manager();
        let update = RecordUpdate {
            prev: Some(router(Some("a"), Some("ns"))),
            curr: router(Some("a"), Some("ns")),
        };
        assert!(manager.diff_record(&update).is_none());
    }

    #[test]
    fn changed_record_carries_only_changes() {
        let manager = manager();
        let update = RecordUpdate {
            prev: Some(router(Some("a"), Some("ns"))),
            curr: router(Some("b"), Some("ns")),
        };
        let delta = manager.diff_record(&update).unwrap();
        let delta = delta.downcast_ref::<RouterRecord>().unwrap();
        assert_eq!(delta.base.id, "router-1");
        assert_eq!(delta.name.as_deref(), Some("b"));
        assert_eq!(delta.namespace, None);
    }

    #[tokio::test]
    async fn next_n_stops_at_limit_and_deadline() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        let far = Instant::now() + Duration::from_secs(5);
        assert_eq!(next_n(&cancel, &mut rx, 3, far).await, vec![0, 1, 2]);

        let soon = Instant::now() + Duration::from_millis(20);
        assert_eq!(next_n(&cancel, &mut rx, 10, soon).await, vec![3, 4]);
        assert!(next_n(&cancel, &mut rx, 0, far).await.is_empty());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let manager = Arc::new(manager());
        let cancel = CancellationToken::new();
        let first = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.run(&cancel).await, Err(ManagerError::AlreadyRunning));
        cancel.cancel();
        assert_eq!(first.await.unwrap(), Ok(()));
    }
}
