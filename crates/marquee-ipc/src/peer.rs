use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::transport::{PipeTransport, TransportBuilder};

/// External process speaking the framed protocol over its stdin and stdout.
///
/// The peer's stderr is inherited so its logs land next to ours.
#[derive(Debug)]
pub struct PeerProcess {
    config: PeerConfig,
    pid: u32,
    child: Mutex<Option<Child>>,
    transport: Arc<PipeTransport>,
}

impl PeerProcess {
    pub fn spawn<F>(config: PeerConfig, handler: F) -> Result<Self>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        Self::spawn_with(config, handler, || {})
    }

    /// Like [`PeerProcess::spawn`], running `on_disconnect` when the pipe closes.
    pub fn spawn_with<F, H>(config: PeerConfig, handler: F, on_disconnect: H) -> Result<Self>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
        H: FnOnce() + Send + 'static,
    {
        let mut command = Command::new(&config.executable);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn peer at {:?}", config.executable))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("peer stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("peer stdin not captured"))?;

        let transport = TransportBuilder::new(config.transport.clone())
            .on_disconnect(on_disconnect)
            .spawn(stdout, stdin, handler);
        let transport = match transport {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err).context("failed to connect to peer");
            }
        };

        info!(pid, executable = ?config.executable, "peer started");
        Ok(Self {
            config,
            pid,
            child: Mutex::new(Some(child)),
            transport,
        })
    }

    pub fn transport(&self) -> &Arc<PipeTransport> {
        &self.transport
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Closes the pipes and waits for the peer to exit, killing it once the
    /// grace period runs out. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.transport.disconnect();

        let Some(mut child) = self.child.lock().take() else {
            return Ok(());
        };

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            if let Some(status) = child.try_wait()? {
                debug!(pid = self.pid, ?status, "peer exited");
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        warn!(pid = self.pid, "peer ignored shutdown, killing it");
        child.kill().context("failed to kill peer")?;
        child.wait().context("failed to reap peer")?;
        Ok(())
    }
}

impl Drop for PeerProcess {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(%err, pid = self.pid, "peer shutdown failed");
        }
    }
}
