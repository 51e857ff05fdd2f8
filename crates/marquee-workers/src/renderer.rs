use std::io;
use std::sync::Arc;
use std::thread;

use marquee_bus::{DeliveryError, Recipient};
use marquee_ipc::Envelope;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start render thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("render thread has shut down")]
    ExecutorClosed,
    #[error("render task did not finish in time")]
    TimedOut,
    #[error("renderer backend failed: {0}")]
    Backend(String),
}

/// What a worker renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub content: String,
    pub url: String,
    /// Script evaluated once the content has loaded.
    pub on_load_script: Option<String>,
}

/// One live renderer instance. Lives and dies on the render thread.
pub trait RendererInstance {
    /// Endpoint the bus can deliver events to, if the instance accepts any.
    fn recipient(&self) -> Option<Arc<dyn Recipient>> {
        None
    }
}

/// Creates and destroys renderer instances.
///
/// Only ever called on the render thread.
pub trait RendererBackend {
    fn create(
        &mut self,
        id: &str,
        spec: &WorkerSpec,
    ) -> Result<Box<dyn RendererInstance>, RenderError>;

    fn destroy(&mut self, id: &str, instance: Box<dyn RendererInstance>);
}

impl<B: RendererBackend + ?Sized> RendererBackend for Box<B> {
    fn create(
        &mut self,
        id: &str,
        spec: &WorkerSpec,
    ) -> Result<Box<dyn RendererInstance>, RenderError> {
        (**self).create(id, spec)
    }

    fn destroy(&mut self, id: &str, instance: Box<dyn RendererInstance>) {
        (**self).destroy(id, instance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Created {
        id: String,
        spec: WorkerSpec,
        thread: Option<String>,
    },
    Destroyed {
        id: String,
        thread: Option<String>,
    },
    Delivered {
        id: String,
        name: String,
    },
}

/// Shared view of what a [`RecordingBackend`] did.
#[derive(Debug, Clone, Default)]
pub struct RecordingLog {
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.ids(|call| match call {
            BackendCall::Created { id, .. } => Some(id),
            _ => None,
        })
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.ids(|call| match call {
            BackendCall::Destroyed { id, .. } => Some(id),
            _ => None,
        })
    }

    fn ids(&self, pick: impl Fn(&BackendCall) -> Option<&String>) -> Vec<String> {
        self.calls.lock().iter().filter_map(pick).cloned().collect()
    }

    fn push(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

/// Headless backend that renders nothing and records every lifecycle call.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    log: RecordingLog,
    failing_urls: Vec<String>,
}

impl RecordingBackend {
    pub fn new(log: RecordingLog) -> Self {
        Self {
            log,
            failing_urls: Vec::new(),
        }
    }

    /// Makes creation fail for workers pointing at `url`.
    pub fn failing_on(mut self, url: impl Into<String>) -> Self {
        self.failing_urls.push(url.into());
        self
    }
}

struct RecordingInstance {
    inbox: Arc<RecordingInbox>,
}

impl RendererInstance for RecordingInstance {
    fn recipient(&self) -> Option<Arc<dyn Recipient>> {
        Some(self.inbox.clone())
    }
}

struct RecordingInbox {
    id: String,
    log: RecordingLog,
}

impl Recipient for RecordingInbox {
    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let name = envelope
            .event_parts()
            .map(|(name, _)| name)
            .unwrap_or(envelope.name());
        self.log.push(BackendCall::Delivered {
            id: self.id.clone(),
            name: name.to_string(),
        });
        Ok(())
    }
}

fn current_thread_name() -> Option<String> {
    thread::current().name().map(str::to_owned)
}

impl RendererBackend for RecordingBackend {
    fn create(
        &mut self,
        id: &str,
        spec: &WorkerSpec,
    ) -> Result<Box<dyn RendererInstance>, RenderError> {
        if self.failing_urls.iter().any(|url| *url == spec.url) {
            return Err(RenderError::Backend(format!("cannot load {}", spec.url)));
        }
        self.log.push(BackendCall::Created {
            id: id.to_string(),
            spec: spec.clone(),
            thread: current_thread_name(),
        });
        Ok(Box::new(RecordingInstance {
            inbox: Arc::new(RecordingInbox {
                id: id.to_string(),
                log: self.log.clone(),
            }),
        }))
    }

    fn destroy(&mut self, id: &str, _instance: Box<dyn RendererInstance>) {
        self.log.push(BackendCall::Destroyed {
            id: id.to_string(),
            thread: current_thread_name(),
        });
    }
}
