use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::DEFAULT_MAX_FRAME_LEN;

/// What `PipeTransport::write_message` does when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new frame; the write returns `false`.
    #[default]
    Reject,
    /// Discard the oldest queued frame to make room for the new one.
    DropOldest,
}

/// Tuning for a single pipe connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size of the buffer each read lands in.
    pub read_buffer_len: usize,
    /// Frames waiting to be written before `overflow` applies.
    pub outbound_capacity: usize,
    /// Decoded frames waiting for the handler before the reader stalls.
    pub inbound_capacity: usize,
    pub max_frame_len: u32,
    pub overflow: OverflowPolicy,
    /// Prefix for the names of the connection's threads.
    pub thread_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_len: 32 * 1024,
            outbound_capacity: 1024,
            inbound_capacity: 1024,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            overflow: OverflowPolicy::Reject,
            thread_name: "marquee-pipe".into(),
        }
    }
}

/// How to launch an external peer process.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub transport: TransportConfig,
    /// Time a peer gets to exit on its own after its stdin closes.
    pub shutdown_grace: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            executable: std::env::var_os("MARQUEE_PEER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("marquee-peer")),
            args: Vec::new(),
            transport: TransportConfig::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}
