//! Delivered messages and the handles bound to a correlated exchange

use crate::connection::ConnectionShared;
use crate::error::Result;
use bytes::Bytes;
use liteconn_core::CorrelationId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Unit handed to the application by `receive` or a resolved request.
pub struct Message {
    payload: Bytes,
    request: Option<ResponseHandle>,
}

impl Message {
    pub(crate) fn data(payload: Bytes) -> Self {
        Self {
            payload,
            request: None,
        }
    }

    pub(crate) fn request(payload: Bytes, handle: ResponseHandle) -> Self {
        Self {
            payload,
            request: Some(handle),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The peer is waiting for a reply to this message
    pub fn is_request(&self) -> bool {
        self.request.is_some()
    }

    /// Take the reply obligation out of the message
    pub fn take_request(&mut self) -> Option<ResponseHandle> {
        self.request.take()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn into_parts(self) -> (Bytes, Option<ResponseHandle>) {
        (self.payload, self.request)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.payload.len())
            .field("request", &self.request.as_ref().map(ResponseHandle::id))
            .finish()
    }
}

enum SlotState {
    Waiting,
    Resolved(Option<Message>),
    Taken,
}

/// One-shot result cell shared by a [`RequestHandle`] and its connection.
pub(crate) struct ResponseSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ResponseSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
        })
    }

    /// Store the outcome unless one is already stored.
    ///
    /// A refused message is handed back so the caller drops it after every
    /// lock is released.
    #[must_use]
    pub(crate) fn resolve(&self, outcome: Option<Message>) -> Option<Message> {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Waiting) {
            return outcome;
        }
        *state = SlotState::Resolved(outcome);
        self.ready.notify_all();
        None
    }

    fn is_ready(&self) -> bool {
        !matches!(*self.state.lock(), SlotState::Waiting)
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        while matches!(*state, SlotState::Waiting) {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
        !matches!(*state, SlotState::Waiting)
    }

    fn take(&self) -> Option<Message> {
        let mut state = self.state.lock();
        while matches!(*state, SlotState::Waiting) {
            self.ready.wait(&mut state);
        }
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Resolved(outcome) => outcome,
            _ => None,
        }
    }
}

/// Outbound view of a request awaiting the peer's reply.
///
/// Dropping the handle does not cancel the request; a reply that arrives
/// later is discarded, and a conversation continuation is rejected.
pub struct RequestHandle {
    id: CorrelationId,
    slot: Arc<ResponseSlot>,
    conn: Weak<ConnectionShared>,
}

impl RequestHandle {
    pub(crate) fn new(
        id: CorrelationId,
        slot: Arc<ResponseSlot>,
        conn: Weak<ConnectionShared>,
    ) -> Self {
        Self { id, slot, conn }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Block until the exchange resolves and take its outcome.
    ///
    /// `None` means no answer: the peer rejected, the request was cancelled,
    /// the connection ended, or the outcome was already taken.
    pub fn get_response(&self) -> Option<Message> {
        self.slot.take()
    }

    /// Block until the exchange resolves or `timeout` elapses
    pub fn wait_for_response(&self, timeout: Option<Duration>) -> bool {
        self.slot.wait(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Give up on the reply and tell the peer to forget the request.
    ///
    /// Returns `false` if the exchange had already resolved.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .conn
            .upgrade()
            .map(|conn| conn.cancel_request(self.id))
            .unwrap_or(false);
        drop(self.slot.resolve(None));
        cancelled
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Inbound view of a request: the obligation to answer it exactly once.
///
/// Dropping the handle without answering rejects the request.
pub struct ResponseHandle {
    id: CorrelationId,
    conn: Weak<ConnectionShared>,
    consumed: bool,
}

impl ResponseHandle {
    pub(crate) fn new(id: CorrelationId, conn: Weak<ConnectionShared>) -> Self {
        Self {
            id,
            conn,
            consumed: false,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Answer the request with `data`.
    ///
    /// `Ok(false)` if the obligation was already gone (peer cancelled or the
    /// connection ended). On error the handle is rejected as it drops.
    pub fn respond(mut self, data: &[u8]) -> Result<bool> {
        let result = match self.conn.upgrade() {
            Some(conn) => conn.respond(self.id, data),
            None => Ok(false),
        };
        if result.is_ok() {
            self.consumed = true;
        }
        result
    }

    /// Decline to answer; the requester resolves to no answer
    pub fn reject(mut self) -> bool {
        self.consumed = true;
        self.conn
            .upgrade()
            .map(|conn| conn.reject(self.id))
            .unwrap_or(false)
    }

    /// Answer with `data` and ask a follow-up question in the same datagram
    pub fn converse(mut self, data: &[u8]) -> Result<Option<RequestHandle>> {
        let result = match self.conn.upgrade() {
            Some(conn) => conn.converse(self.id, data),
            None => Ok(None),
        };
        if result.is_ok() {
            self.consumed = true;
        }
        result
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.reject(self.id);
        }
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.id)
            .field("consumed", &self.consumed)
            .finish()
    }
}
