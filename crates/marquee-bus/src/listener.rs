use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};

use marquee_ipc::{Envelope, EnvelopeError, PipeTransport};
use thiserror::Error;

/// Identity of one live connection or in-process recipient.
///
/// Ids are allocated from a process-wide counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Class of destination a listener belongs to; dispatch filters on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DestinationFlags(u32);

impl DestinationFlags {
    pub const NONE: Self = Self(0);
    /// Embedded surfaces such as docks and sources.
    pub const UI_SURFACE: Self = Self(1 << 0);
    /// Headless workers owned by the worker manager.
    pub const WORKER: Self = Self(1 << 1);
    pub const DIALOG: Self = Self(1 << 2);
    /// External processes attached over a pipe.
    pub const EXTERNAL: Self = Self(1 << 3);
    pub const ALL: Self = Self(u32::MAX);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DestinationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DestinationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("recipient is disconnected")]
    Closed,
    #[error("recipient refused the message: {0}")]
    Refused(String),
    #[error("no listener registered as {0}")]
    UnknownRecipient(ConnectionId),
    #[error(transparent)]
    Encode(#[from] EnvelopeError),
}

/// Anything an envelope can be handed to.
///
/// Delivery must not block for long: it runs on whichever thread dispatches.
pub trait Recipient: Send + Sync {
    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

impl Recipient for PipeTransport {
    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let payload = envelope.to_payload()?;
        if self.write_message(&payload) {
            Ok(())
        } else if !self.is_connected() {
            Err(DeliveryError::Closed)
        } else {
            Err(DeliveryError::Refused("outbound queue full".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_algebra() {
        let flags = DestinationFlags::UI_SURFACE | DestinationFlags::DIALOG;
        assert!(flags.intersects(DestinationFlags::DIALOG));
        assert!(!flags.intersects(DestinationFlags::WORKER));
        assert!(flags.contains(DestinationFlags::UI_SURFACE));
        assert!(!flags.contains(DestinationFlags::UI_SURFACE | DestinationFlags::WORKER));
        assert!(DestinationFlags::ALL.intersects(DestinationFlags::EXTERNAL));
        assert!(!DestinationFlags::NONE.intersects(DestinationFlags::ALL));
        assert!(DestinationFlags::default().is_empty());
    }

    #[test]
    fn connection_ids_are_unique() {
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        assert_ne!(first, second);
        assert!(second.get() > first.get());
        assert_eq!(format!("{}", ConnectionId(4)), "conn-4");
    }
}
