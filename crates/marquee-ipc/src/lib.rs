//! Marquee pipe transport.
//!
//! Duplex, length-prefixed message channel between the host and an external
//! peer over a pair of unidirectional OS pipes. Each connection runs its own
//! read, write and callback threads which block on pipe readiness instead of
//! polling, so an idle connection costs nothing and a disconnect is observed
//! immediately. The envelope layer on top gives every frame a name, typed
//! arguments and an optional correlation id.
//!
//! Readiness waits are built on `poll(2)`, so the crate only builds on unix.

#[cfg(not(unix))]
compile_error!("marquee-ipc waits on pipes with poll(2) and only builds on unix targets");

pub mod config;
pub mod envelope;
pub mod frame;
pub mod peer;
pub mod readiness;
pub mod transport;

pub use config::{OverflowPolicy, PeerConfig, TransportConfig};
pub use envelope::{Arg, Envelope, EnvelopeError, DISPATCH_EVENT, EXECUTE_CALLBACK};
pub use frame::{encode_frame, FrameDecoder, FrameError, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
pub use peer::PeerProcess;
pub use readiness::Endpoint;
pub use transport::{
    DisconnectHook, PipeTransport, TransportBuilder, TransportError, TransportStats,
};
