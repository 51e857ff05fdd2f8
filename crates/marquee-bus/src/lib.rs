//! Listener registry, event dispatch and call correlation.
//!
//! The [`MessageBus`] fans named events out to registered recipients, the
//! [`CorrelationTable`] pairs outgoing calls with their `executeCallback`
//! responses, and a [`HandlerSet`] answers calls arriving from peers.

pub mod bus;
pub mod correlation;
pub mod events;
pub mod handlers;
pub mod listener;

pub use bus::{DispatchReport, MessageBus};
pub use correlation::{
    CallError, CallResponse, CallResult, CorrelationTable, PendingCall, DEFAULT_CALL_TIMEOUT,
};
pub use events::{HostEvent, SceneInfo};
pub use handlers::{
    CapabilityHandler, HandlerSet, SharedStatus, StatusHandler, StatusSnapshot, StatusSource,
};
pub use listener::{ConnectionId, DeliveryError, DestinationFlags, Recipient};
