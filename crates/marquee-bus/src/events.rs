use serde::{Deserialize, Serialize};

/// Scene description carried by [`HostEvent::SceneChanged`] and returned by
/// `getCurrentScene`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Host state change broadcast to every interested listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    StreamingStarting,
    StreamingStarted,
    StreamingStopping,
    StreamingStopped,
    RecordingStarting,
    RecordingStarted,
    RecordingPaused,
    RecordingUnpaused,
    RecordingStopping,
    RecordingStopped,
    ReplayBufferStarting,
    ReplayBufferStarted,
    ReplayBufferStopping,
    ReplayBufferStopped,
    SceneChanged(SceneInfo),
    Exit,
}

const SIMPLE_EVENTS: &[(&str, HostEvent)] = &[
    ("obsStreamingStarting", HostEvent::StreamingStarting),
    ("obsStreamingStarted", HostEvent::StreamingStarted),
    ("obsStreamingStopping", HostEvent::StreamingStopping),
    ("obsStreamingStopped", HostEvent::StreamingStopped),
    ("obsRecordingStarting", HostEvent::RecordingStarting),
    ("obsRecordingStarted", HostEvent::RecordingStarted),
    ("obsRecordingPaused", HostEvent::RecordingPaused),
    ("obsRecordingUnpaused", HostEvent::RecordingUnpaused),
    ("obsRecordingStopping", HostEvent::RecordingStopping),
    ("obsRecordingStopped", HostEvent::RecordingStopped),
    ("obsReplaybufferStarting", HostEvent::ReplayBufferStarting),
    ("obsReplaybufferStarted", HostEvent::ReplayBufferStarted),
    ("obsReplaybufferStopping", HostEvent::ReplayBufferStopping),
    ("obsReplaybufferStopped", HostEvent::ReplayBufferStopped),
    ("obsExit", HostEvent::Exit),
];

const SCENE_CHANGED: &str = "obsSceneChanged";

impl HostEvent {
    /// Event name as listeners see it.
    pub fn name(&self) -> &'static str {
        if let HostEvent::SceneChanged(_) = self {
            return SCENE_CHANGED;
        }
        SIMPLE_EVENTS
            .iter()
            .find(|(_, event)| event == self)
            .map(|(name, _)| *name)
            .unwrap_or(SCENE_CHANGED)
    }

    /// JSON text of the event arguments; empty for events without any.
    pub fn args_json(&self) -> String {
        match self {
            HostEvent::SceneChanged(scene) => {
                serde_json::to_string(scene).unwrap_or_else(|_| "{}".into())
            }
            _ => String::new(),
        }
    }

    /// Parses a wire name (and arguments) back into an event.
    pub fn from_wire(name: &str, args_json: &str) -> Option<Self> {
        if name == SCENE_CHANGED {
            return serde_json::from_str(args_json).ok().map(HostEvent::SceneChanged);
        }
        SIMPLE_EVENTS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, event)| event.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_simple_event_has_a_distinct_name() {
        let mut names: Vec<_> = SIMPLE_EVENTS.iter().map(|(_, event)| event.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SIMPLE_EVENTS.len());
        assert_eq!(HostEvent::RecordingPaused.name(), "obsRecordingPaused");
        assert_eq!(HostEvent::Exit.args_json(), "");
    }

    #[test]
    fn scene_changes_carry_their_geometry() {
        let event = HostEvent::SceneChanged(SceneInfo {
            name: "Intro".into(),
            width: 1920,
            height: 1080,
        });
        assert_eq!(event.name(), "obsSceneChanged");
        let json: serde_json::Value = serde_json::from_str(&event.args_json()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "Intro", "width": 1920, "height": 1080})
        );
        assert_eq!(
            HostEvent::from_wire(event.name(), &event.args_json()),
            Some(event)
        );
    }

    #[test]
    fn unknown_or_malformed_names_do_not_parse() {
        assert_eq!(HostEvent::from_wire("obsNothing", ""), None);
        assert_eq!(HostEvent::from_wire("obsSceneChanged", "not json"), None);
        assert_eq!(
            HostEvent::from_wire("obsStreamingStarted", ""),
            Some(HostEvent::StreamingStarted)
        );
    }
}
