//! Table of in-flight tool calls awaiting a correlated reply.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use outpost_proto::Envelope;

/// Lifecycle of a relayed call.
///
/// `Sent` and `Awaiting` are the in-flight states kept in the table; the
/// other three are terminal and returned by the operation that removes the
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Registered, request not yet handed to the writer.
    Sent,
    /// Request queued on the connection, waiting for the reply.
    Awaiting,
    /// Reply delivered to the waiter.
    Completed,
    /// Waiter gave up.
    TimedOut,
    /// Connection went away before a reply arrived.
    Orphaned,
}

struct PendingCall {
    hostname: String,
    connection_id: Uuid,
    state: CallState,
    tx: oneshot::Sender<Envelope>,
}

/// In-flight calls keyed by call id. One reply per call.
///
/// The lock is never held across an await, so entries can be dropped from
/// synchronous code such as [`PendingGuard`].
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `call_id` for `hostname` on connection `connection_id` and
    /// return the reply receiver.
    pub fn register(
        &self,
        call_id: &str,
        hostname: &str,
        connection_id: Uuid,
    ) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(
            call_id.to_string(),
            PendingCall {
                hostname: hostname.to_string(),
                connection_id,
                state: CallState::Sent,
                tx,
            },
        );
        rx
    }

    pub fn mark_awaiting(&self, call_id: &str) {
        if let Some(call) = self.calls.lock().get_mut(call_id) {
            call.state = CallState::Awaiting;
        }
    }

    /// Deliver a reply. Returns `false` if no call with that id is pending.
    pub fn complete(&self, call_id: &str, reply: Envelope) -> bool {
        let call = self.calls.lock().remove(call_id);
        match call {
            Some(call) => {
                debug!(call_id, hostname = %call.hostname, state = ?CallState::Completed, "Call completed");
                call.tx.send(reply).is_ok()
            }
            None => false,
        }
    }

    /// Remove a call whose waiter gave up.
    pub fn time_out(&self, call_id: &str) -> Option<CallState> {
        self.calls
            .lock()
            .remove(call_id)
            .map(|_| CallState::TimedOut)
    }

    /// Remove a call without a reply, e.g. when sending failed.
    pub fn remove(&self, call_id: &str) -> bool {
        self.calls.lock().remove(call_id).is_some()
    }

    /// Fail every call pending on `hostname`. Waiters observe a dropped
    /// sender. Returns the number of orphaned calls.
    pub fn orphan_host(&self, hostname: &str) -> usize {
        self.orphan_where(|call| call.hostname == hostname)
    }

    /// Fail every call sent on one connection, leaving calls on a newer
    /// connection of the same host alone.
    pub fn orphan_connection(&self, connection_id: Uuid) -> usize {
        self.orphan_where(|call| call.connection_id == connection_id)
    }

    fn orphan_where(&self, matches: impl Fn(&PendingCall) -> bool) -> usize {
        let mut calls = self.calls.lock();
        let before = calls.len();
        calls.retain(|_, call| !matches(call));
        let orphaned = before - calls.len();
        if orphaned > 0 {
            debug!(orphaned, state = ?CallState::Orphaned, "Pending calls orphaned");
        }
        orphaned
    }

    /// State of an in-flight call.
    pub fn state(&self, call_id: &str) -> Option<CallState> {
        self.calls.lock().get(call_id).map(|call| call.state)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

/// Removes its call from the table when dropped, whichever way the caller
/// leaves: reply, error, timeout or cancellation.
pub struct PendingGuard {
    pending: Arc<PendingCalls>,
    call_id: String,
}

impl PendingGuard {
    pub fn new(pending: Arc<PendingCalls>, call_id: impl Into<String>) -> Self {
        Self {
            pending,
            call_id: call_id.into(),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.pending.remove(&self.call_id) {
            debug!(call_id = %self.call_id, "Abandoned call removed");
        }
    }
}
