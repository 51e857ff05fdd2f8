use std::sync::Arc;

use marquee_ipc::{Arg, Envelope};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::events::{HostEvent, SceneInfo};

/// Answers inbound calls from peers.
///
/// Returning `None` declines the call and lets the next handler try.
pub trait CapabilityHandler: Send + Sync {
    fn handle(&self, name: &str, args: &[Arg]) -> Option<Value>;
}

impl<F> CapabilityHandler for F
where
    F: Fn(&str, &[Arg]) -> Option<Value> + Send + Sync,
{
    fn handle(&self, name: &str, args: &[Arg]) -> Option<Value> {
        self(name, args)
    }
}

/// Handlers consulted in registration order; the first claim wins.
#[derive(Default, Clone)]
pub struct HandlerSet {
    handlers: Vec<Arc<dyn CapabilityHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl CapabilityHandler + 'static) -> Self {
        self.push(Arc::new(handler));
        self
    }

    pub fn push(&mut self, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handle(&self, name: &str, args: &[Arg]) -> Option<Value> {
        self.handlers
            .iter()
            .find_map(|handler| handler.handle(name, args))
    }

    /// Runs `request` through the handlers and builds the `executeCallback`
    /// reply. No reply is produced when nobody claims the name or the request
    /// carries no correlation id.
    pub fn respond(&self, request: &Envelope) -> Option<Envelope> {
        let Some(result) = self.handle(request.name(), request.args()) else {
            debug!(name = request.name(), "no handler claimed call");
            return None;
        };
        let id = request.id()?;
        let slot = request.int_arg(0).unwrap_or(0);
        Some(Envelope::callback(id, slot, result.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub recording: bool,
    pub streaming: bool,
    pub replaybuffer: bool,
}

/// Where the status handler reads host state from.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> StatusSnapshot;

    fn current_scene(&self) -> Option<SceneInfo> {
        None
    }
}

/// Status kept up to date by feeding it the host events as they happen.
#[derive(Debug, Default)]
pub struct SharedStatus {
    state: Mutex<(StatusSnapshot, Option<SceneInfo>)>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &HostEvent) {
        let mut state = self.state.lock();
        let (status, scene) = &mut *state;
        match event {
            HostEvent::StreamingStarted => status.streaming = true,
            HostEvent::StreamingStopped => status.streaming = false,
            HostEvent::RecordingStarted => status.recording = true,
            HostEvent::RecordingStopped => status.recording = false,
            HostEvent::ReplayBufferStarted => status.replaybuffer = true,
            HostEvent::ReplayBufferStopped => status.replaybuffer = false,
            HostEvent::SceneChanged(info) => *scene = Some(info.clone()),
            _ => {}
        }
    }
}

impl StatusSource for SharedStatus {
    fn status(&self) -> StatusSnapshot {
        self.state.lock().0
    }

    fn current_scene(&self) -> Option<SceneInfo> {
        self.state.lock().1.clone()
    }
}

/// Claims `getStatus` and `getCurrentScene`.
pub struct StatusHandler {
    source: Arc<dyn StatusSource>,
}

impl StatusHandler {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self { source }
    }
}

impl CapabilityHandler for StatusHandler {
    fn handle(&self, name: &str, _args: &[Arg]) -> Option<Value> {
        match name {
            "getStatus" => serde_json::to_value(self.source.status()).ok(),
            "getCurrentScene" => Some(
                self.source
                    .current_scene()
                    .and_then(|scene| serde_json::to_value(scene).ok())
                    .unwrap_or_else(|| json!({})),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn status_handlers(source: Arc<SharedStatus>) -> HandlerSet {
        HandlerSet::new().with(StatusHandler::new(source))
    }

    #[test]
    fn get_status_replies_with_the_callers_slot() {
        let source = Arc::new(SharedStatus::new());
        source.apply(&HostEvent::RecordingStarted);
        let handlers = status_handlers(source);

        let reply = handlers
            .respond(&Envelope::call(9, "getStatus", vec![Arg::Int(4)]))
            .expect("claimed");
        assert_eq!(reply.id(), Some(9));
        assert!(reply.is_callback());
        assert_eq!(reply.int_arg(0), Some(4));
        let body: Value = serde_json::from_str(reply.str_arg(1).unwrap()).unwrap();
        assert_eq!(
            body,
            json!({"recording": true, "streaming": false, "replaybuffer": false})
        );
    }

    #[test]
    fn current_scene_defaults_to_empty_object() {
        let source = Arc::new(SharedStatus::new());
        let handlers = status_handlers(source.clone());

        let reply = handlers
            .respond(&Envelope::call(1, "getCurrentScene", vec![Arg::Int(0)]))
            .unwrap();
        assert_eq!(reply.str_arg(1), Some("{}"));

        source.apply(&HostEvent::SceneChanged(SceneInfo {
            name: "Main".into(),
            width: 1280,
            height: 720,
        }));
        let reply = handlers
            .respond(&Envelope::call(2, "getCurrentScene", vec![Arg::Int(0)]))
            .unwrap();
        let body: Value = serde_json::from_str(reply.str_arg(1).unwrap()).unwrap();
        assert_eq!(body, json!({"name": "Main", "width": 1280, "height": 720}));
    }

    #[test]
    fn unclaimed_names_get_no_reply() {
        let handlers = status_handlers(Arc::new(SharedStatus::new()));
        assert!(handlers
            .respond(&Envelope::call(1, "launchRockets", vec![]))
            .is_none());
    }

    #[test]
    fn first_registered_handler_wins() {
        let handlers = HandlerSet::new()
            .with(|name: &str, _: &[Arg]| (name == "ping").then(|| json!("first")))
            .with(|_: &str, _: &[Arg]| Some(json!("fallback")));

        assert_eq!(handlers.handle("ping", &[]), Some(json!("first")));
        assert_eq!(handlers.handle("other", &[]), Some(json!("fallback")));
        assert_eq!(handlers.len(), 2);
    }

    #[test]
    fn notifications_without_id_are_handled_but_not_answered() {
        let handlers = status_handlers(Arc::new(SharedStatus::new()));
        assert!(handlers
            .respond(&Envelope::new("getStatus", vec![Arg::Int(0)]))
            .is_none());
    }
}
