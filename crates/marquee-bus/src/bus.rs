use std::fmt;
use std::sync::Arc;

use marquee_ipc::Envelope;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::events::HostEvent;
use crate::listener::{ConnectionId, DeliveryError, DestinationFlags, Recipient};

#[derive(Clone)]
struct Listener {
    connection: ConnectionId,
    flags: DestinationFlags,
    recipient: Arc<dyn Recipient>,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Listeners whose delivery failed; the failure was logged and skipped.
    pub failed: usize,
    /// Listeners filtered out by their flags.
    pub skipped: usize,
}

/// Registry of dispatch destinations.
///
/// The registry lock is only held to mutate the list or to copy it; every
/// delivery happens after the lock is released, so a recipient may register
/// or remove listeners from inside `deliver`.
#[derive(Default)]
pub struct MessageBus {
    listeners: Mutex<Vec<Listener>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `recipient` as `connection`.
    ///
    /// Registering a connection twice keeps its original position and
    /// replaces its flags and recipient. Returns `true` for a new listener.
    pub fn add_listener(
        &self,
        connection: ConnectionId,
        flags: DestinationFlags,
        recipient: Arc<dyn Recipient>,
    ) -> bool {
        let mut listeners = self.listeners.lock();
        if let Some(existing) = listeners
            .iter_mut()
            .find(|listener| listener.connection == connection)
        {
            debug!(%connection, ?flags, "listener re-registered");
            existing.flags = flags;
            existing.recipient = recipient;
            return false;
        }
        listeners.push(Listener {
            connection,
            flags,
            recipient,
        });
        debug!(%connection, ?flags, "listener registered");
        true
    }

    /// Removes `connection`; returns whether it was registered.
    pub fn remove_listener(&self, connection: ConnectionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.connection != connection);
        let removed = listeners.len() != before;
        if removed {
            debug!(%connection, "listener removed");
        }
        removed
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.listeners
            .lock()
            .iter()
            .any(|listener| listener.connection == connection)
    }

    pub fn flags(&self, connection: ConnectionId) -> Option<DestinationFlags> {
        self.listeners
            .lock()
            .iter()
            .find(|listener| listener.connection == connection)
            .map(|listener| listener.flags)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Unregisters every listener.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.listeners.lock());
        debug!(count = removed.len(), "listener registry cleared");
    }

    /// Sends the event to every listener whose flags intersect `filter`, in
    /// registration order.
    pub fn dispatch(
        &self,
        event_name: &str,
        args_json: &str,
        filter: DestinationFlags,
    ) -> DispatchReport {
        let envelope = Envelope::event(event_name, args_json);
        self.dispatch_envelope(&envelope, filter)
    }

    pub fn dispatch_host_event(&self, event: &HostEvent) -> DispatchReport {
        self.dispatch(event.name(), &event.args_json(), DestinationFlags::ALL)
    }

    /// Broadcasts an already built envelope.
    pub fn dispatch_envelope(
        &self,
        envelope: &Envelope,
        filter: DestinationFlags,
    ) -> DispatchReport {
        let snapshot = self.listeners.lock().clone();

        let mut report = DispatchReport::default();
        for listener in &snapshot {
            if !listener.flags.intersects(filter) {
                report.skipped += 1;
                continue;
            }
            match listener.recipient.deliver(envelope) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        connection = %listener.connection,
                        name = envelope.name(),
                        %err,
                        "dispatch to listener failed"
                    );
                }
            }
        }
        debug!(name = envelope.name(), ?report, "dispatched");
        report
    }

    /// Delivers an event to exactly one listener, ignoring its flags.
    pub fn send_direct(
        &self,
        connection: ConnectionId,
        event_name: &str,
        args_json: &str,
    ) -> Result<(), DeliveryError> {
        self.send_envelope(connection, &Envelope::event(event_name, args_json))
    }

    pub fn send_envelope(
        &self,
        connection: ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), DeliveryError> {
        let recipient = self
            .recipient(connection)
            .ok_or(DeliveryError::UnknownRecipient(connection))?;
        recipient.deliver(envelope)
    }

    pub fn recipient(&self, connection: ConnectionId) -> Option<Arc<dyn Recipient>> {
        self.listeners
            .lock()
            .iter()
            .find(|listener| listener.connection == connection)
            .map(|listener| Arc::clone(&listener.recipient))
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_list()
            .entries(
                listeners
                    .iter()
                    .map(|listener| (listener.connection, listener.flags)),
            )
            .finish()
    }
}
