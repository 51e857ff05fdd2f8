use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use marquee_bus::{
    CapabilityHandler, ConnectionId, CorrelationTable, DeliveryError, DestinationFlags,
    DispatchReport, HandlerSet, HostEvent, MessageBus, PendingCall, Recipient, SharedStatus,
    StatusHandler, StatusSource,
};
use marquee_ipc::{
    Arg, Endpoint, Envelope, PeerConfig, PeerProcess, PipeTransport, TransportBuilder,
    TransportConfig,
};
use marquee_workers::{RecordingBackend, RecordingLog, RendererBackend, WorkerManager};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::control::WorkerControlHandler;

type BackendFactory = Box<dyn FnOnce() -> Box<dyn RendererBackend> + Send>;

/// Assembles a [`Host`].
pub struct HostBuilder {
    config: HostConfig,
    status: Option<Arc<dyn StatusSource>>,
    backend: Option<BackendFactory>,
    handlers: Vec<Arc<dyn CapabilityHandler>>,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
            status: None,
            backend: None,
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Source answering `getStatus` and `getCurrentScene`.
    pub fn status(mut self, status: Arc<dyn StatusSource>) -> Self {
        self.status = Some(status);
        self
    }

    /// Backend for worker instances, built on the render thread. Defaults to
    /// a headless [`RecordingBackend`].
    pub fn backend<F, B>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> B + Send + 'static,
        B: RendererBackend + 'static,
    {
        self.backend = Some(Box::new(move || {
            Box::new(factory()) as Box<dyn RendererBackend>
        }));
        self
    }

    /// Extra handler consulted after the built-in ones.
    pub fn handler(mut self, handler: impl CapabilityHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Host> {
        let bus = Arc::new(MessageBus::new());
        let backend: BackendFactory = match self.backend {
            Some(factory) => factory,
            None => Box::new(|| Box::new(RecordingBackend::new(RecordingLog::new()))),
        };
        let workers = Arc::new(
            WorkerManager::builder()
                .bus(Arc::clone(&bus))
                .thread_name(self.config.render_thread.clone())
                .spawn(backend)
                .context("failed to start the render thread")?,
        );

        let status = self
            .status
            .unwrap_or_else(|| Arc::new(SharedStatus::new()) as Arc<dyn StatusSource>);
        let mut handlers = HandlerSet::new()
            .with(StatusHandler::new(status))
            .with(WorkerControlHandler::new(Arc::clone(&workers)));
        for handler in self.handlers {
            handlers.push(handler);
        }

        let inner = Arc::new(HostInner {
            calls: CorrelationTable::new(self.config.call_timeout()),
            config: self.config,
            bus,
            handlers,
            workers,
            peers: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
        });
        let maintenance = Maintenance::spawn(Arc::downgrade(&inner))?;

        info!("host ready");
        Ok(Host {
            inner,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }
}

struct HostInner {
    config: HostConfig,
    bus: Arc<MessageBus>,
    calls: CorrelationTable,
    handlers: HandlerSet,
    workers: Arc<WorkerManager>,
    peers: Mutex<HashMap<ConnectionId, Arc<PipeTransport>>>,
    processes: Mutex<HashMap<ConnectionId, PeerProcess>>,
}

impl HostInner {
    /// Inbound traffic of one peer: responses settle pending calls, calls go
    /// to the handlers and get answered on the same pipe.
    fn route(&self, connection: ConnectionId, transport: &PipeTransport, payload: &[u8]) {
        let envelope = match Envelope::from_payload(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%connection, %err, "dropping undecodable message");
                return;
            }
        };

        if envelope.is_callback() {
            self.calls.resolve(connection, &envelope);
            return;
        }
        if let Some((name, _)) = envelope.event_parts() {
            debug!(%connection, name, "event from peer");
            return;
        }

        if let Some(reply) = self.handlers.respond(&envelope) {
            if let Err(err) = transport.deliver(&reply) {
                warn!(%connection, name = envelope.name(), %err, "reply not sent");
            }
        }
    }

    fn forget(&self, connection: ConnectionId) {
        self.bus.remove_listener(connection);
        let abandoned = self.calls.abandon_connection(connection);
        let transport = self.peers.lock().remove(&connection);
        if transport.is_some() {
            info!(%connection, abandoned, "peer disconnected");
        }
    }

    /// Reaps peer processes whose pipe has closed.
    fn reap(&self) {
        let finished: Vec<PeerProcess> = {
            let mut processes = self.processes.lock();
            let closed: Vec<ConnectionId> = processes
                .iter()
                .filter(|(_, process)| !process.transport().is_connected())
                .map(|(connection, _)| *connection)
                .collect();
            closed
                .iter()
                .filter_map(|connection| processes.remove(connection))
                .collect()
        };
        for process in finished {
            if let Err(err) = process.shutdown() {
                warn!(pid = process.id(), %err, "failed to reap peer");
            }
        }
    }
}

/// Periodic sweep of expired calls and exited peers.
struct Maintenance {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Maintenance {
    fn spawn(inner: Weak<HostInner>) -> Result<Self> {
        let interval = match inner.upgrade() {
            Some(inner) => inner.config.maintenance_interval(),
            None => anyhow::bail!("host dropped before maintenance started"),
        };
        let (stop, stop_rx) = bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("marquee-maintenance".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let expired = inner.calls.sweep_expired(Instant::now());
                if expired > 0 {
                    debug!(expired, "expired calls swept");
                }
                inner.reap();
            })
            .context("failed to start the maintenance thread")?;
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Stand-in recipient for calls addressed to unknown connections.
struct Missing(ConnectionId);

impl Recipient for Missing {
    fn deliver(&self, _envelope: &Envelope) -> Result<(), DeliveryError> {
        Err(DeliveryError::UnknownRecipient(self.0))
    }
}

/// Wires the bus, the correlation table, the capability handlers and the
/// worker manager to peer connections.
pub struct Host {
    inner: Arc<HostInner>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    pub fn new(config: HostConfig, status: Arc<dyn StatusSource>) -> Result<Self> {
        HostBuilder::new().config(config).status(status).build()
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.inner.workers
    }

    pub fn calls(&self) -> &CorrelationTable {
        &self.inner.calls
    }

    /// Connects a peer over an existing pair of pipe endpoints and registers
    /// it as an `EXTERNAL` listener.
    pub fn attach_peer<R, W>(&self, reader: R, writer: W) -> Result<ConnectionId>
    where
        R: Read + Endpoint + Send + 'static,
        W: Write + Endpoint + Send + 'static,
    {
        let connection = ConnectionId::next();
        let (handler, hook, slot) = self.connection_callbacks(connection);
        let transport = TransportBuilder::new(self.transport_config(connection))
            .on_disconnect(hook)
            .spawn(reader, writer, handler)
            .context("failed to start peer transport")?;
        self.register(connection, Arc::new(transport), &slot);
        Ok(connection)
    }

    /// Launches a peer process and attaches to its stdin and stdout.
    pub fn spawn_peer(&self, mut config: PeerConfig) -> Result<ConnectionId> {
        let connection = ConnectionId::next();
        config.transport = self.transport_config(connection);
        let (handler, hook, slot) = self.connection_callbacks(connection);
        let process = PeerProcess::spawn_with(config, handler, hook)?;
        self.register(connection, Arc::clone(process.transport()), &slot);
        self.inner.processes.lock().insert(connection, process);
        Ok(connection)
    }

    /// Closes a peer connection, stopping its process if the host launched it.
    pub fn disconnect_peer(&self, connection: ConnectionId) -> bool {
        let transport = self.inner.peers.lock().get(&connection).cloned();
        let process = self.inner.processes.lock().remove(&connection);
        let known = transport.is_some() || process.is_some();

        if let Some(transport) = transport {
            transport.disconnect();
        }
        if let Some(process) = process {
            if let Err(err) = process.shutdown() {
                warn!(%connection, %err, "peer shutdown failed");
            }
        }
        self.inner.forget(connection);
        known
    }

    /// Connected peers, oldest first.
    pub fn peers(&self) -> Vec<ConnectionId> {
        let mut peers: Vec<_> = self.inner.peers.lock().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Issues a correlated call to a listener.
    ///
    /// Calls to unknown connections resolve as closed immediately.
    pub fn call(&self, connection: ConnectionId, method: &str, args: Vec<Arg>) -> PendingCall {
        match self.inner.bus.recipient(connection) {
            Some(recipient) => self
                .inner
                .calls
                .call(connection, recipient.as_ref(), method, args),
            None => self
                .inner
                .calls
                .call(connection, &Missing(connection), method, args),
        }
    }

    pub fn dispatch(
        &self,
        event_name: &str,
        args_json: &str,
        filter: DestinationFlags,
    ) -> DispatchReport {
        self.inner.bus.dispatch(event_name, args_json, filter)
    }

    pub fn dispatch_host_event(&self, event: &HostEvent) -> DispatchReport {
        self.inner.bus.dispatch_host_event(event)
    }

    pub fn send_direct(
        &self,
        connection: ConnectionId,
        event_name: &str,
        args_json: &str,
    ) -> Result<(), DeliveryError> {
        self.inner.bus.send_direct(connection, event_name, args_json)
    }

    /// Disconnects every peer, destroys every worker and stops the host's
    /// threads. Idempotent.
    pub fn shutdown(&self) {
        let Some(mut maintenance) = self.maintenance.lock().take() else {
            return;
        };
        maintenance.stop();

        for connection in self.peers() {
            self.disconnect_peer(connection);
        }
        let processes: Vec<_> = self
            .inner
            .processes
            .lock()
            .drain()
            .map(|(_, process)| process)
            .collect();
        for process in processes {
            let _ = process.shutdown();
        }
        self.inner.workers.shutdown();
        self.inner.bus.clear();
        info!("host shut down");
    }

    fn transport_config(&self, connection: ConnectionId) -> TransportConfig {
        let mut config = self.inner.config.transport.clone();
        config.thread_name = format!("marquee-peer-{}", connection.get());
        config
    }

    /// Handler and disconnect hook for a connection whose transport will be
    /// published through the returned slot once it exists.
    fn connection_callbacks(
        &self,
        connection: ConnectionId,
    ) -> (
        impl FnMut(Vec<u8>) + Send + 'static,
        impl FnOnce() + Send + 'static,
        Arc<OnceCell<Weak<PipeTransport>>>,
    ) {
        let slot: Arc<OnceCell<Weak<PipeTransport>>> = Arc::new(OnceCell::new());

        let inner = Arc::downgrade(&self.inner);
        let transport_slot = Arc::clone(&slot);
        let handler = move |payload: Vec<u8>| {
            let (Some(inner), Some(transport)) = (inner.upgrade(), transport_slot.wait().upgrade())
            else {
                return;
            };
            inner.route(connection, &transport, &payload);
        };

        let inner = Arc::downgrade(&self.inner);
        let hook = move || {
            if let Some(inner) = inner.upgrade() {
                inner.forget(connection);
            }
        };

        (handler, hook, slot)
    }

    fn register(
        &self,
        connection: ConnectionId,
        transport: Arc<PipeTransport>,
        slot: &OnceCell<Weak<PipeTransport>>,
    ) {
        let _ = slot.set(Arc::downgrade(&transport));
        self.inner
            .bus
            .add_listener(connection, DestinationFlags::EXTERNAL, transport.clone());
        self.inner.peers.lock().insert(connection, Arc::clone(&transport));
        info!(%connection, "peer attached");

        // The peer may have hung up before it was registered.
        if !transport.is_connected() {
            self.inner.forget(connection);
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}
