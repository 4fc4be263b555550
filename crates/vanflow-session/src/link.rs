//! Sender and receiver links that survive session replacement.

use crate::container::{Reports, SessionSlot};
use crate::transport::{BusReceiver, BusSender, Session, TransportError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vanflow_proto::Message;

/// Errors returned by link operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The link was closed by its owner
    #[error("link closed")]
    Closed,
    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
    /// The container stopped and will not reconnect
    #[error("container stopped")]
    Stopped,
    /// The underlying transport failed; the session will be rebuilt
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl LinkError {
    /// Whether retrying the operation can never succeed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

#[derive(Default)]
struct LinkState {
    closed: bool,
    curr: Option<Arc<dyn Session>>,
    curr_gen: u64,
    rcv: Option<(u64, Arc<dyn BusReceiver>)>,
    snd: Option<(u64, Arc<dyn BusSender>)>,
}

pub(crate) struct Link {
    address: String,
    credit: usize,
    state: Mutex<LinkState>,
    sessions: watch::Receiver<SessionSlot>,
    reports: Reports,
}

impl Link {
    pub(crate) fn new(
        address: String,
        credit: usize,
        sessions: watch::Receiver<SessionSlot>,
        reports: Reports,
    ) -> Self {
        Self {
            address,
            credit,
            state: Mutex::new(LinkState::default()),
            sessions,
            reports,
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the session to use, waiting for a newer generation when the
    /// cached binding was cleared after a failure.
    async fn await_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(u64, Arc<dyn Session>), LinkError> {
        let prev_gen = {
            let state = self.state();
            if state.closed {
                return Err(LinkError::Closed);
            }
            if let Some(curr) = &state.curr {
                return Ok((state.curr_gen, Arc::clone(curr)));
            }
            state.curr_gen
        };

        let mut sessions = self.sessions.clone();
        loop {
            {
                let slot = sessions.borrow_and_update();
                if slot.generation != prev_gen {
                    let Some(session) = slot.session.clone() else {
                        return Err(LinkError::Stopped);
                    };
                    let generation = slot.generation;
                    drop(slot);
                    let mut state = self.state();
                    if state.closed {
                        return Err(LinkError::Closed);
                    }
                    state.curr = Some(Arc::clone(&session));
                    state.curr_gen = generation;
                    return Ok((generation, session));
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(LinkError::Cancelled),
                changed = sessions.changed() => {
                    if changed.is_err() {
                        return Err(LinkError::Stopped);
                    }
                }
            }
        }
    }

    async fn receiver(
        &self,
        generation: u64,
        session: &Arc<dyn Session>,
    ) -> Result<Arc<dyn BusReceiver>, TransportError> {
        let cached = self.state().rcv.clone();
        if let Some((bound, rcv)) = cached {
            if bound == generation {
                return Ok(rcv);
            }
        }
        let rcv = session.new_receiver(&self.address, self.credit).await?;
        self.state().rcv = Some((generation, Arc::clone(&rcv)));
        Ok(rcv)
    }

    async fn sender(
        &self,
        generation: u64,
        session: &Arc<dyn Session>,
    ) -> Result<Arc<dyn BusSender>, TransportError> {
        let cached = self.state().snd.clone();
        if let Some((bound, snd)) = cached {
            if bound == generation {
                return Ok(snd);
            }
        }
        let snd = session.new_sender(&self.address).await?;
        self.state().snd = Some((generation, Arc::clone(&snd)));
        Ok(snd)
    }

    /// Report a transport failure and drop the cached binding. Failures of a
    /// link closed by its owner are not reported; the session stays up.
    fn fail(&self, generation: u64, error: TransportError) -> LinkError {
        let mut state = self.state();
        if state.closed {
            tracing::trace!(address = %self.address, generation, error = %error, "Closed link operation ended");
            return LinkError::Closed;
        }
        tracing::debug!(address = %self.address, generation, error = %error, "Link operation failed");
        self.reports.failure(generation, error.clone());
        if state.curr_gen == generation {
            state.curr = None;
            state.rcv = None;
            state.snd = None;
        }
        LinkError::Transport(error)
    }

    async fn close(&self) {
        let (rcv, snd) = {
            let mut state = self.state();
            state.closed = true;
            state.curr = None;
            (state.rcv.take(), state.snd.take())
        };
        if let Some((_, rcv)) = rcv {
            rcv.close().await;
        }
        if let Some((_, snd)) = snd {
            snd.close().await;
        }
    }
}

/// Sending link.
#[derive(Clone)]
pub struct Sender {
    link: Arc<Link>,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("address", &self.link.address)
            .finish_non_exhaustive()
    }
}

impl Sender {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Link address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.link.address
    }

    /// Send a message on the current session.
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed, `cancel` fires, or the transport
    /// fails. Transport failures trigger a reconnect; the message is not
    /// retried.
    pub async fn send(&self, cancel: &CancellationToken, msg: Message) -> Result<(), LinkError> {
        let (generation, session) = self.link.await_session(cancel).await?;
        let snd = tokio::select! {
            () = cancel.cancelled() => return Err(LinkError::Cancelled),
            snd = self.link.sender(generation, &session) => {
                snd.map_err(|error| self.link.fail(generation, error))?
            }
        };
        let sent = tokio::select! {
            () = cancel.cancelled() => return Err(LinkError::Cancelled),
            sent = snd.send(msg) => sent,
        };
        match sent {
            Ok(()) => {
                self.link.reports.healthy(generation);
                Ok(())
            }
            Err(error) => Err(self.link.fail(generation, error)),
        }
    }

    /// Close the link permanently.
    pub async fn close(&self) {
        self.link.close().await;
    }
}

/// Receiving link.
#[derive(Clone)]
pub struct Receiver {
    link: Arc<Link>,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("address", &self.link.address)
            .field("credit", &self.link.credit)
            .finish_non_exhaustive()
    }
}

impl Receiver {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Link address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.link.address
    }

    /// Wait for the next message.
    ///
    /// Transport failures are reported to the container and the receive is
    /// retried on the next session.
    ///
    /// # Errors
    ///
    /// Returns error only if `cancel` fires, the link is closed, or the
    /// container stopped.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Message, LinkError> {
        loop {
            match self.try_next(cancel).await {
                Ok(msg) => return Ok(msg),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(LinkError::Cancelled);
                    }
                    tracing::debug!(address = %self.link.address, error = %err, "Receive failed, waiting for next session");
                }
            }
        }
    }

    async fn try_next(&self, cancel: &CancellationToken) -> Result<Message, LinkError> {
        let (generation, session) = self.link.await_session(cancel).await?;
        let rcv = tokio::select! {
            () = cancel.cancelled() => return Err(LinkError::Cancelled),
            rcv = self.link.receiver(generation, &session) => {
                rcv.map_err(|error| self.link.fail(generation, error))?
            }
        };
        let received = tokio::select! {
            () = cancel.cancelled() => return Err(LinkError::Cancelled),
            received = rcv.receive() => received,
        };
        match received {
            Ok(msg) => {
                self.link.reports.healthy(generation);
                Ok(msg)
            }
            Err(error) => Err(self.link.fail(generation, error)),
        }
    }

    /// Settle a received message.
    ///
    /// Settlement failures are returned to the caller but never trigger a
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed, `cancel` fires, or settlement
    /// fails.
    pub async fn accept(&self, cancel: &CancellationToken, msg: &Message) -> Result<(), LinkError> {
        let (generation, session) = self.link.await_session(cancel).await?;
        let rcv = self
            .link
            .receiver(generation, &session)
            .await
            .map_err(|error| self.link.fail(generation, error))?;
        let accepted = tokio::select! {
            () = cancel.cancelled() => return Err(LinkError::Cancelled),
            accepted = rcv.accept(msg) => accepted,
        };
        accepted?;
        self.link.reports.healthy(generation);
        Ok(())
    }

    /// Close the link permanently.
    pub async fn close(&self) {
        self.link.close().await;
    }
}
