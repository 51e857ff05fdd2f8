use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use marquee_bus::{DestinationFlags, MessageBus};
use marquee_workers::{
    BackendCall, RecordingBackend, RecordingLog, WorkerError, WorkerManager, WorkerState,
    DEFAULT_RENDER_THREAD,
};
use pretty_assertions::assert_eq;

const READY: Duration = Duration::from_secs(2);

fn spawn_manager() -> (WorkerManager, RecordingLog) {
    let log = RecordingLog::new();
    let backend_log = log.clone();
    let manager = WorkerManager::spawn(move || RecordingBackend::new(backend_log)).expect("manager");
    (manager, log)
}

#[test]
fn add_remove_scenario() {
    let (manager, _log) = spawn_manager();

    let w1 = manager.add("w1", "<html></html>", "about:blank", "");
    assert_eq!(w1, "w1");

    let generated = manager.add("", "<p>hi</p>", "https://example.com", "");
    assert!(!generated.is_empty());
    assert_ne!(generated, w1);

    assert!(manager.remove("w1"));
    let ids = manager.identifiers();
    assert!(!ids.contains(&"w1".to_string()));
    assert!(ids.contains(&generated));
}

#[test]
fn colliding_id_gets_a_fresh_one() {
    let (manager, _log) = spawn_manager();
    manager.add("dup", "a", "about:blank", "");
    let second = manager.add("dup", "b", "about:blank", "");

    assert_ne!(second, "dup");
    assert_eq!(manager.content("dup").as_deref(), Some("a"));
    assert_eq!(manager.content(&second).as_deref(), Some("b"));
}

#[test]
fn remove_twice_is_idempotent() {
    let (manager, log) = spawn_manager();
    let id = manager.add("once", "<p/>", "about:blank", "");
    manager.wait_ready(&id, READY).unwrap();

    assert!(manager.remove(&id));
    assert!(!manager.remove(&id));
    manager.shutdown();

    assert_eq!(log.destroyed(), vec!["once".to_string()]);
}

#[test]
fn instances_live_on_the_render_thread() {
    let (manager, log) = spawn_manager();
    let id = manager.add("w", "<p/>", "about:blank", "boot()");
    manager.wait_ready(&id, READY).unwrap();
    assert_eq!(manager.state(&id), Some(WorkerState::Ready));
    manager.remove(&id);
    manager.shutdown();

    let render = Some(DEFAULT_RENDER_THREAD.to_string());
    for call in log.calls() {
        match call {
            BackendCall::Created { thread, spec, .. } => {
                assert_eq!(thread, render);
                assert_eq!(spec.on_load_script.as_deref(), Some("boot()"));
            }
            BackendCall::Destroyed { thread, .. } => assert_eq!(thread, render),
            BackendCall::Delivered { .. } => {}
        }
    }
}

#[test]
fn failed_creation_is_reported_by_wait_ready() {
    let log = RecordingLog::new();
    let backend_log = log.clone();
    let manager = WorkerManager::spawn(move || {
        RecordingBackend::new(backend_log).failing_on("https://broken.invalid")
    })
    .unwrap();

    let id = manager.add("bad", "<p/>", "https://broken.invalid", "");
    assert!(matches!(
        manager.wait_ready(&id, READY),
        Err(WorkerError::Failed(failed)) if failed == "bad"
    ));
    assert_eq!(manager.state(&id), Some(WorkerState::Failed));
    assert!(matches!(
        manager.wait_ready("ghost", READY),
        Err(WorkerError::Unknown(_))
    ));
}

#[test]
fn serialize_then_deserialize_reproduces_the_registry() {
    let (source, _) = spawn_manager();
    source.add("w1", "<html></html>", "about:blank", "");
    source.add("w2", "<b>two</b>", "https://example.com/two", "init()");
    source.add("", "<i>gen</i>", "about:blank", "");

    let (target, _) = spawn_manager();
    let ids = target.deserialize(&source.serialize());
    assert_eq!(ids.len(), 3);

    let tuples = |manager: &WorkerManager| -> BTreeSet<_> {
        manager
            .identifiers()
            .into_iter()
            .map(|id| {
                let spec = manager.spec(&id).unwrap();
                (id, spec.content, spec.url, spec.on_load_script)
            })
            .collect()
    };
    assert_eq!(tuples(&target), tuples(&source));
}

#[test]
fn deserialize_into_live_registry_renames_collisions() {
    let (manager, _) = spawn_manager();
    manager.add("w1", "<old/>", "about:blank", "");
    let snapshot = manager.serialize();

    let ids = manager.deserialize(&snapshot);
    assert_eq!(ids.len(), 1);
    assert_ne!(ids[0], "w1");
    assert_eq!(manager.len(), 2);
    assert_eq!(manager.content(&ids[0]).as_deref(), Some("<old/>"));
}

#[test]
fn single_entry_round_trip() {
    let (manager, _) = spawn_manager();
    manager.add("solo", "<s/>", "about:blank", "");
    let entry = manager.serialize_one("solo").unwrap();

    let (other, _) = spawn_manager();
    assert_eq!(other.deserialize_one(&entry).as_deref(), Some("solo"));
    assert_eq!(other.deserialize_one(&serde_json::json!({"url": "x"})), None);
}

#[test]
fn ready_workers_join_the_bus_and_leave_on_remove() {
    let bus = Arc::new(MessageBus::new());
    let log = RecordingLog::new();
    let backend_log = log.clone();
    let manager = WorkerManager::builder()
        .bus(Arc::clone(&bus))
        .spawn(move || RecordingBackend::new(backend_log))
        .unwrap();

    let id = manager.add("listener", "<p/>", "about:blank", "");
    manager.wait_ready(&id, READY).unwrap();
    assert_eq!(bus.listener_count(), 1);

    let report = bus.dispatch("obsSceneChanged", "{}", DestinationFlags::WORKER);
    assert_eq!(report.delivered, 1);
    assert!(log.calls().contains(&BackendCall::Delivered {
        id: "listener".into(),
        name: "obsSceneChanged".into(),
    }));

    manager.remove(&id);
    assert_eq!(bus.listener_count(), 0);
    assert_eq!(
        bus.dispatch("late", "", DestinationFlags::ALL).delivered,
        0
    );
}

#[test]
fn shutdown_destroys_everything_and_stops_accepting_work() {
    let (manager, log) = spawn_manager();
    for index in 0..3 {
        let id = manager.add(&format!("w{index}"), "<p/>", "about:blank", "");
        manager.wait_ready(&id, READY).unwrap();
    }
    manager.shutdown();
    manager.shutdown();

    let mut destroyed = log.destroyed();
    destroyed.sort();
    assert_eq!(destroyed, vec!["w0", "w1", "w2"]);
    assert!(manager.is_empty());

    let late = manager.add("late", "<p/>", "about:blank", "");
    assert_eq!(manager.state(&late), None);
    assert!(manager.identifiers().is_empty());
    assert_eq!(manager.serialize(), serde_json::json!({}));
    assert!(matches!(
        manager.wait_ready(&late, READY),
        Err(WorkerError::Unknown(_))
    ));
}
