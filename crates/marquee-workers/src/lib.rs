//! Headless content workers.
//!
//! Renderer instances may only be touched from one designated thread. The
//! [`RenderExecutor`] owns that thread and the renderer backend living on it;
//! the [`WorkerManager`] keeps the worker records and marshals every instance
//! lifecycle change onto the render thread.

pub mod executor;
pub mod manager;
pub mod renderer;

pub use executor::{RenderExecutor, TaskHandle};
pub use manager::{
    WorkerEntry, WorkerError, WorkerManager, WorkerManagerBuilder, WorkerState,
    DEFAULT_RENDER_THREAD,
};
pub use renderer::{
    BackendCall, RecordingBackend, RecordingLog, RenderError, RendererBackend, RendererInstance,
    WorkerSpec,
};
