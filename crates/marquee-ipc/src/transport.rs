use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{OverflowPolicy, TransportConfig};
use crate::frame::{encode_frame, FrameDecoder};
use crate::readiness::{Endpoint, Interest, Readiness, Waker};

/// Largest slice handed to a single `write` once the pipe reports POLLOUT;
/// writes up to PIPE_BUF never block on a writable pipe.
#[cfg(target_os = "linux")]
const WRITE_CHUNK: usize = 4096;
#[cfg(not(target_os = "linux"))]
const WRITE_CHUNK: usize = 512;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create wake pipe: {0}")]
    Waker(#[source] io::Error),
    #[error("failed to start {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type DisconnectHook = Box<dyn FnOnce() + Send + 'static>;

/// Traffic counters of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Frames refused or discarded because the outbound queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    connected: Mutex<bool>,
    waker: Waker,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
    // Dropping the sender is the shutdown broadcast for every loop.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    on_disconnect: Mutex<Option<DisconnectHook>>,
    counters: Counters,
    overflow: OverflowPolicy,
    max_frame_len: u32,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    /// Flips the connection to closed. Returns `false` if it already was.
    fn close(&self) -> bool {
        {
            let mut connected = self.connected.lock();
            if !*connected {
                return false;
            }
            *connected = false;
        }
        self.waker.wake();
        self.shutdown_tx.lock().take();

        let hook = self.on_disconnect.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    fn enqueue(&self, frame: Vec<u8>) -> bool {
        match self.outbound_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(frame)) => match self.overflow {
                OverflowPolicy::Reject => {
                    Counters::bump(&self.counters.dropped, 1);
                    warn!("outbound queue full, rejecting frame");
                    false
                }
                OverflowPolicy::DropOldest => {
                    if self.outbound_rx.try_recv().is_ok() {
                        Counters::bump(&self.counters.dropped, 1);
                        debug!("outbound queue full, dropped oldest frame");
                    }
                    self.outbound_tx.try_send(frame).is_ok()
                }
            },
        }
    }
}

/// Configures and starts a [`PipeTransport`].
pub struct TransportBuilder {
    config: TransportConfig,
    on_disconnect: Option<DisconnectHook>,
}

impl TransportBuilder {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            on_disconnect: None,
        }
    }

    /// Runs once when the connection closes, whichever side closed it.
    pub fn on_disconnect(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_disconnect = Some(Box::new(hook));
        self
    }

    /// Takes ownership of both endpoints and starts the connection threads.
    ///
    /// `handler` receives every inbound payload, in the order the peer wrote
    /// them, on a dedicated callback thread.
    pub fn spawn<R, W, F>(
        self,
        reader: R,
        writer: W,
        handler: F,
    ) -> Result<PipeTransport, TransportError>
    where
        R: Read + Endpoint + Send + 'static,
        W: Write + Endpoint + Send + 'static,
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let config = self.config;
        let waker = Waker::new().map_err(TransportError::Waker)?;
        let (outbound_tx, outbound_rx) = bounded(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = bounded(config.inbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let shared = Arc::new(Shared {
            connected: Mutex::new(true),
            waker,
            outbound_tx,
            outbound_rx: outbound_rx.clone(),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            on_disconnect: Mutex::new(self.on_disconnect),
            counters: Counters::default(),
            overflow: config.overflow,
            max_frame_len: config.max_frame_len,
        });

        let transport = PipeTransport {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(3)),
        };

        {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown_rx.clone();
            transport.start(format!("{}-callback", config.thread_name), move || {
                callback_loop(shared, inbound_rx, shutdown, handler)
            })?;
        }
        {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown_rx.clone();
            transport.start(format!("{}-write", config.thread_name), move || {
                write_loop(shared, writer, outbound_rx, shutdown)
            })?;
        }
        {
            let buffer_len = config.read_buffer_len.max(1);
            transport.start(format!("{}-read", config.thread_name), move || {
                read_loop(shared, reader, inbound_tx, shutdown_rx, buffer_len)
            })?;
        }

        info!(thread = %config.thread_name, "pipe transport connected");
        Ok(transport)
    }
}

/// Duplex framed byte channel over two unidirectional pipe endpoints.
///
/// Each connection owns a read thread, a write thread and a callback thread.
/// Reads and writes block on OS readiness; disconnecting wakes every thread
/// and joins it. Writers on any thread enqueue without blocking.
pub struct PipeTransport {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PipeTransport {
    pub fn new<R, W, F>(
        reader: R,
        writer: W,
        config: TransportConfig,
        handler: F,
    ) -> Result<Self, TransportError>
    where
        R: Read + Endpoint + Send + 'static,
        W: Write + Endpoint + Send + 'static,
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        TransportBuilder::new(config).spawn(reader, writer, handler)
    }

    pub fn builder(config: TransportConfig) -> TransportBuilder {
        TransportBuilder::new(config)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Frames `payload` and queues it for the write thread.
    ///
    /// Returns `false` without queuing when the connection is closed, the
    /// payload cannot be framed, or the queue is full under
    /// [`OverflowPolicy::Reject`]. Never blocks.
    pub fn write_message(&self, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let frame = match encode_frame(payload, self.shared.max_frame_len) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "refusing to queue message");
                return false;
            }
        };
        self.shared.enqueue(frame)
    }

    /// Closes both endpoints and joins the connection threads. Idempotent.
    ///
    /// Frames still queued for writing are abandoned.
    pub fn disconnect(&self) {
        if self.shared.close() {
            info!("pipe transport disconnected");
        }

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            // Called from the handler: the callback thread winds down by itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("pipe transport thread panicked");
            }
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    fn start<F>(&self, name: String, body: F) -> Result<(), TransportError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|source| TransportError::Spawn { name, source })?;
        self.threads.lock().push(handle);
        Ok(())
    }
}

impl fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeTransport")
            .field("connected", &self.is_connected())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_loop<R>(
    shared: Arc<Shared>,
    mut reader: R,
    inbound: Sender<Vec<u8>>,
    shutdown: Receiver<()>,
    buffer_len: usize,
) where
    R: Read + Endpoint,
{
    let mut decoder = FrameDecoder::new(shared.max_frame_len);
    let mut buffer = vec![0u8; buffer_len];

    'io: while shared.is_connected() {
        match shared.waker.wait(&reader, Interest::Read) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Woken) => break,
            Err(err) => {
                warn!(%err, "waiting on pipe failed");
                break;
            }
        }

        let read = match reader.read(&mut buffer) {
            Ok(0) => {
                debug!("peer closed the pipe");
                break;
            }
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(%err, "pipe read failed");
                break;
            }
        };
        Counters::bump(&shared.counters.bytes_in, read as u64);

        let frames = match decoder.decode(&buffer[..read]) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(%err, "framing violation, dropping connection");
                break;
            }
        };

        for frame in frames {
            Counters::bump(&shared.counters.frames_in, 1);
            select! {
                send(inbound, frame) -> sent => {
                    if sent.is_err() {
                        break 'io;
                    }
                }
                recv(shutdown) -> _ => break 'io,
            }
        }
    }

    shared.close();
}

fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    outbound: Receiver<Vec<u8>>,
    shutdown: Receiver<()>,
) where
    W: Write + Endpoint,
{
    loop {
        let frame = select! {
            recv(outbound) -> frame => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        };
        if !shared.is_connected() {
            break;
        }

        match write_frame(&shared.waker, &mut writer, &frame) {
            Ok(true) => {
                Counters::bump(&shared.counters.frames_out, 1);
                Counters::bump(&shared.counters.bytes_out, frame.len() as u64);
            }
            Ok(false) => break,
            Err(err) => {
                warn!(%err, "pipe write failed");
                break;
            }
        }
    }

    shared.close();
}

/// Writes one frame; `Ok(false)` when interrupted by a disconnect.
fn write_frame<W>(waker: &Waker, writer: &mut W, frame: &[u8]) -> io::Result<bool>
where
    W: Write + Endpoint,
{
    for chunk in frame.chunks(WRITE_CHUNK) {
        let mut remaining = chunk;
        while !remaining.is_empty() {
            if waker.wait(writer, Interest::Write)? == Readiness::Woken {
                return Ok(false);
            }
            match writer.write(remaining) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => remaining = &remaining[written..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
    writer.flush()?;
    Ok(true)
}

fn callback_loop<F>(
    shared: Arc<Shared>,
    inbound: Receiver<Vec<u8>>,
    shutdown: Receiver<()>,
    mut handler: F,
) where
    F: FnMut(Vec<u8>),
{
    loop {
        select! {
            recv(inbound) -> frame => match frame {
                Ok(frame) => handler(frame),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }

    // Frames decoded before the close are still handed over, best effort.
    for frame in inbound.try_iter() {
        handler(frame);
    }
    debug!(connected = shared.is_connected(), "pipe callback loop finished");
}
