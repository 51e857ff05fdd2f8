//! Call/response semantics over fire-and-forget delivery.
//!
//! Every call gets the next id of its connection and a pending entry holding
//! a one-shot completion slot. An inbound `executeCallback` envelope with a
//! matching id fills the slot and removes the entry; responses with unknown
//! ids are dropped. Entries that outlive their deadline or their connection
//! are resolved as errors, so no waiter is left hanging.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use marquee_ipc::{Arg, Envelope};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::listener::{ConnectionId, Recipient};

/// Default lifetime of a pending call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    /// First argument of the original call, echoed back by the responder.
    pub slot: i64,
    /// JSON text produced by the responder.
    pub payload: String,
}

impl CallResponse {
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("connection closed before the call was sent")]
    Closed,
    #[error("no response before the deadline")]
    TimedOut,
    #[error("connection went away before responding")]
    Abandoned,
}

pub type CallResult = Result<CallResponse, CallError>;

struct Pending {
    deadline: Instant,
    slot: Sender<CallResult>,
}

#[derive(Default)]
struct Table {
    next_ids: HashMap<ConnectionId, u64>,
    pending: HashMap<(ConnectionId, u64), Pending>,
}

/// Pending-request table shared by every connection.
pub struct CorrelationTable {
    table: Mutex<Table>,
    timeout: Duration,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl CorrelationTable {
    /// `timeout` bounds how long an unanswered call stays pending.
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issues `method(args)` to `recipient` and returns the handle to wait on.
    ///
    /// A call that cannot be sent resolves to [`CallError::Closed`] at once.
    pub fn call(
        &self,
        connection: ConnectionId,
        recipient: &dyn Recipient,
        method: &str,
        args: Vec<Arg>,
    ) -> PendingCall {
        let (slot, rx) = bounded(1);
        let id = {
            let mut table = self.table.lock();
            let next = table.next_ids.entry(connection).or_insert(0);
            *next += 1;
            let id = *next;
            table.pending.insert(
                (connection, id),
                Pending {
                    deadline: Instant::now() + self.timeout,
                    slot,
                },
            );
            id
        };

        let envelope = Envelope::call(id, method, args);
        if let Err(err) = recipient.deliver(&envelope) {
            warn!(%connection, id, method, %err, "call could not be sent");
            self.settle(connection, id, Err(CallError::Closed));
        } else {
            debug!(%connection, id, method, "call issued");
        }

        PendingCall {
            connection,
            id,
            rx,
            outcome: OnceCell::new(),
        }
    }

    /// Matches an inbound `executeCallback` envelope against the pending
    /// calls of `connection`. Returns `false` when nothing was waiting for it.
    pub fn resolve(&self, connection: ConnectionId, envelope: &Envelope) -> bool {
        if !envelope.is_callback() {
            return false;
        }
        let Some(id) = envelope.id() else {
            debug!(%connection, "callback without correlation id dropped");
            return false;
        };

        let slot = envelope.int_arg(0).unwrap_or(0);
        let payload = match envelope.args().get(1) {
            Some(Arg::Str(text)) => text.clone(),
            Some(Arg::Json(value)) => value.to_string(),
            Some(Arg::Int(value)) => value.to_string(),
            None => String::new(),
        };

        let settled = self.settle(connection, id, Ok(CallResponse { slot, payload }));
        if !settled {
            debug!(%connection, id, "response for unknown call dropped");
        }
        settled
    }

    /// Resolves every call still waiting on `connection` as abandoned.
    pub fn abandon_connection(&self, connection: ConnectionId) -> usize {
        let abandoned: Vec<Pending> = {
            let mut table = self.table.lock();
            table.next_ids.remove(&connection);
            let keys: Vec<_> = table
                .pending
                .keys()
                .filter(|(owner, _)| *owner == connection)
                .copied()
                .collect();
            keys.iter()
                .filter_map(|key| table.pending.remove(key))
                .collect()
        };

        for pending in &abandoned {
            let _ = pending.slot.try_send(Err(CallError::Abandoned));
        }
        if !abandoned.is_empty() {
            debug!(%connection, count = abandoned.len(), "pending calls abandoned");
        }
        abandoned.len()
    }

    /// Resolves every call whose deadline is before `now` as timed out.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<Pending> = {
            let mut table = self.table.lock();
            let keys: Vec<_> = table
                .pending
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(key, _)| *key)
                .collect();
            keys.iter()
                .filter_map(|key| table.pending.remove(key))
                .collect()
        };

        for pending in &expired {
            let _ = pending.slot.try_send(Err(CallError::TimedOut));
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired calls swept");
        }
        expired.len()
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    fn settle(&self, connection: ConnectionId, id: u64, result: CallResult) -> bool {
        let pending = self.table.lock().pending.remove(&(connection, id));
        match pending {
            Some(pending) => {
                let _ = pending.slot.try_send(result);
                true
            }
            None => false,
        }
    }
}

/// Caller's handle on one issued call.
#[derive(Debug)]
pub struct PendingCall {
    connection: ConnectionId,
    id: u64,
    rx: Receiver<CallResult>,
    outcome: OnceCell<CallResult>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The outcome, if the call has settled.
    pub fn try_result(&self) -> Option<CallResult> {
        if let Some(outcome) = self.outcome.get() {
            return Some(outcome.clone());
        }
        match self.rx.try_recv() {
            Ok(result) => Some(self.settle(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.settle(Err(CallError::Abandoned))),
        }
    }

    /// Blocks until the call settles or `timeout` elapses.
    ///
    /// An elapsed `timeout` returns [`CallError::TimedOut`] but leaves the
    /// call pending; a later wait may still see the response.
    pub fn wait(&self, timeout: Duration) -> CallResult {
        if let Some(outcome) = self.outcome.get() {
            return outcome.clone();
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => self.settle(result),
            Err(RecvTimeoutError::Timeout) => Err(CallError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => self.settle(Err(CallError::Abandoned)),
        }
    }

    fn settle(&self, result: CallResult) -> CallResult {
        self.outcome.get_or_init(|| result).clone()
    }
}
