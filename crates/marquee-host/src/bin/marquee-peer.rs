//! Reference peer speaking the framed protocol over stdin and stdout.
//!
//! Calls are answered with an `executeCallback` echoing their name and
//! arguments. `relay` forwards the call named by its second argument to the
//! host and answers with the host's response.
//!
//! The mode comes from the first argument or `MARQUEE_PEER_MODE`: `echo` is
//! the default, `silent` leaves calls unanswered and `exit` hangs up at once.

use std::collections::HashMap;
use std::env;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use marquee_ipc::{Arg, Envelope, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init()
        .ok();

    let mode = env::args()
        .nth(1)
        .or_else(|| env::var("MARQUEE_PEER_MODE").ok())
        .unwrap_or_else(|| "echo".to_string());
    if mode == "exit" {
        return Ok(());
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut peer = EchoPeer::new(stdout.lock(), mode == "silent");
    let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
    let mut buffer = vec![0u8; 32 * 1024];

    loop {
        let read = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("failed to read from host"),
        };
        let frames = decoder
            .decode(&buffer[..read])
            .context("host sent a malformed frame")?;
        for payload in frames {
            match Envelope::from_payload(&payload) {
                Ok(envelope) => peer.handle(&envelope)?,
                Err(err) => warn!(%err, "undecodable message from host"),
            }
        }
    }

    info!("host closed the pipe");
    Ok(())
}

struct EchoPeer<W> {
    output: W,
    silent: bool,
    next_id: u64,
    /// Relayed call id -> (caller's call id, caller's slot).
    relays: HashMap<u64, (u64, i64)>,
}

impl<W: Write> EchoPeer<W> {
    fn new(output: W, silent: bool) -> Self {
        Self {
            output,
            silent,
            next_id: 1,
            relays: HashMap::new(),
        }
    }

    fn handle(&mut self, envelope: &Envelope) -> Result<()> {
        if let Some((name, args)) = envelope.event_parts() {
            info!(name, args, "event");
            return Ok(());
        }
        if envelope.is_callback() {
            return self.finish_relay(envelope);
        }

        let Some(id) = envelope.id() else {
            debug!(name = envelope.name(), "notification ignored");
            return Ok(());
        };
        if self.silent {
            debug!(id, name = envelope.name(), "leaving call unanswered");
            return Ok(());
        }

        let slot = envelope.int_arg(0).unwrap_or(0);
        if envelope.name() == "relay" {
            if let Some(method) = envelope.str_arg(1) {
                let relayed = self.next_id;
                self.next_id += 1;
                let mut args = vec![Arg::Int(slot)];
                args.extend(envelope.args().iter().skip(2).cloned());
                self.relays.insert(relayed, (id, slot));
                return self.send(&Envelope::call(relayed, method, args));
            }
        }

        let echo = json!({ "name": envelope.name(), "args": envelope.args() });
        self.send(&Envelope::callback(id, slot, echo.to_string()))
    }

    fn finish_relay(&mut self, response: &Envelope) -> Result<()> {
        let relay = response.id().and_then(|id| self.relays.remove(&id));
        let Some((caller, slot)) = relay else {
            debug!(id = ?response.id(), "response to no relay");
            return Ok(());
        };
        let payload = response.str_arg(1).unwrap_or("null").to_string();
        self.send(&Envelope::callback(caller, slot, payload))
    }

    fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.encode(DEFAULT_MAX_FRAME_LEN)?;
        self.output
            .write_all(&frame)
            .and_then(|()| self.output.flush())
            .context("failed to write to host")
    }
}
