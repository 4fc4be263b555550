//! In-process message bus.
//!
//! Routes messages between sessions of the same [`MemoryBus`]. Addresses
//! with the `mc/` prefix fan out to every receiver and are dropped when
//! nobody listens. Other addresses are delivered to one receiver at a time,
//! round-robin, in send order; messages no receiver can take are held (up
//! to a limit, oldest dropped first) until one can.
//!
//! The bus can be told to drop every live session or to refuse new ones,
//! which is how reconnect behaviour is exercised in tests.

use crate::transport::{BusReceiver, BusSender, Connector, Session, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use vanflow_proto::addresses::is_multicast;
use vanflow_proto::Message;

/// Anycast messages kept per address while no subscriber can take them.
const HELD_LIMIT: usize = 1024;

struct Subscription {
    id: u64,
    session: u64,
    tx: mpsc::Sender<Message>,
}

struct BusState {
    reachable: bool,
    connects: usize,
    next_id: u64,
    live_sessions: HashSet<u64>,
    subscriptions: HashMap<String, Vec<Subscription>>,
    cursors: HashMap<String, usize>,
    held: HashMap<String, VecDeque<Message>>,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            reachable: true,
            connects: 0,
            next_id: 0,
            live_sessions: HashSet::new(),
            subscriptions: HashMap::new(),
            cursors: HashMap::new(),
            held: HashMap::new(),
        }
    }
}

impl BusState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn drop_session(&mut self, session: u64) {
        self.live_sessions.remove(&session);
        for subs in self.subscriptions.values_mut() {
            subs.retain(|sub| sub.session != session);
        }
    }

    fn deliver(&mut self, address: &str, msg: Message) {
        let subs = self.subscriptions.entry(address.to_string()).or_default();
        subs.retain(|sub| !sub.tx.is_closed());

        if is_multicast(address) {
            for sub in subs.iter() {
                if sub.tx.try_send(msg.clone()).is_err() {
                    tracing::trace!(address, subscription = sub.id, "Multicast receiver full, dropping");
                }
            }
            return;
        }

        let held = self.held.entry(address.to_string()).or_default();
        if held.len() >= HELD_LIMIT {
            held.pop_front();
            tracing::trace!(address, "Held queue full, dropping oldest message");
        }
        held.push_back(msg);
        self.drain_held(address);
    }

    /// Hand held anycast messages to subscribers round-robin, oldest first,
    /// until every subscriber is full or the queue is empty.
    fn drain_held(&mut self, address: &str) {
        let Some(held) = self.held.get_mut(address) else {
            return;
        };
        let Some(subs) = self.subscriptions.get_mut(address) else {
            return;
        };
        subs.retain(|sub| !sub.tx.is_closed());
        let count = subs.len();
        let cursor = self.cursors.entry(address.to_string()).or_default();
        'messages: while let Some(mut msg) = held.pop_front() {
            for offset in 0..count {
                let index = (*cursor + offset) % count;
                match subs[index].tx.try_send(msg) {
                    Ok(()) => {
                        *cursor = (index + 1) % count;
                        continue 'messages;
                    }
                    Err(TrySendError::Full(back) | TrySendError::Closed(back)) => msg = back,
                }
            }
            held.push_front(msg);
            break;
        }
        if held.is_empty() {
            self.held.remove(address);
        }
    }
}

/// Shared in-process bus. Cloning is cheap; clones route to the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBus")
            .field("reachable", &state.reachable)
            .field("connects", &state.connects)
            .field("live_sessions", &state.live_sessions.len())
            .finish_non_exhaustive()
    }
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow or refuse new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Sever every live session. Their links fail on next use.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let sessions: Vec<u64> = state.live_sessions.iter().copied().collect();
        for session in sessions {
            state.drop_session(session);
        }
        tracing::debug!("Memory bus disconnected all sessions");
    }

    /// Number of successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Number of receivers currently attached to `address`.
    #[must_use]
    pub fn receiver_count(&self, address: &str) -> usize {
        self.lock()
            .subscriptions
            .get(address)
            .map_or(0, |subs| subs.iter().filter(|sub| !sub.tx.is_closed()).count())
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.lock();
        for subs in state.subscriptions.values_mut() {
            subs.retain(|sub| sub.id != id);
        }
    }
}

#[async_trait]
impl Connector for MemoryBus {
    async fn connect(&self) -> Result<Arc<dyn Session>, TransportError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(TransportError::Connect("memory bus unreachable".into()));
        }
        let id = state.next_id();
        state.connects += 1;
        state.live_sessions.insert(id);
        Ok(Arc::new(MemorySession {
            bus: self.clone(),
            id,
        }))
    }
}

struct MemorySession {
    bus: MemoryBus,
    id: u64,
}

impl MemorySession {
    fn check_live(&self) -> Result<(), TransportError> {
        if self.bus.lock().live_sessions.contains(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn new_sender(&self, address: &str) -> Result<Arc<dyn BusSender>, TransportError> {
        self.check_live()?;
        Ok(Arc::new(MemorySender {
            bus: self.bus.clone(),
            session: self.id,
            address: address.to_string(),
        }))
    }

    async fn new_receiver(
        &self,
        address: &str,
        credit: usize,
    ) -> Result<Arc<dyn BusReceiver>, TransportError> {
        let (tx, rx) = mpsc::channel(credit.max(1));
        let mut state = self.bus.lock();
        if !state.live_sessions.contains(&self.id) {
            return Err(TransportError::Closed);
        }
        let id = state.next_id();
        state
            .subscriptions
            .entry(address.to_string())
            .or_default()
            .push(Subscription {
                id,
                session: self.id,
                tx,
            });
        if !is_multicast(address) {
            state.drain_held(address);
        }
        Ok(Arc::new(MemoryReceiver {
            bus: self.bus.clone(),
            session: self.id,
            address: address.to_string(),
            id,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn close(&self) {
        self.bus.lock().drop_session(self.id);
    }
}

struct MemorySender {
    bus: MemoryBus,
    session: u64,
    address: String,
}

#[async_trait]
impl BusSender for MemorySender {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        if !state.live_sessions.contains(&self.session) {
            return Err(TransportError::Closed);
        }
        state.deliver(&self.address, msg);
        Ok(())
    }

    async fn close(&self) {}
}

struct MemoryReceiver {
    bus: MemoryBus,
    session: u64,
    address: String,
    id: u64,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

#[async_trait]
impl BusReceiver for MemoryReceiver {
    async fn receive(&self) -> Result<Message, TransportError> {
        let msg = self.rx.lock().await.recv().await.ok_or(TransportError::Closed)?;
        if !is_multicast(&self.address) {
            // A slot just freed up.
            self.bus.lock().drain_held(&self.address);
        }
        Ok(msg)
    }

    async fn accept(&self, _msg: &Message) -> Result<(), TransportError> {
        if self.bus.lock().live_sessions.contains(&self.session) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn close(&self) {
        self.bus.unsubscribe(self.id);
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
