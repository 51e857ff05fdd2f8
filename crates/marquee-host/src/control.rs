use std::sync::Arc;

use marquee_bus::CapabilityHandler;
use marquee_ipc::Arg;
use marquee_workers::WorkerManager;
use serde_json::{json, Value};
use tracing::debug;

/// Lets peers drive the worker manager.
///
/// Every call takes the caller's slot as its first argument and its payload
/// as the second: a worker id for `removeWorker` and `getWorkerContent`, a
/// worker entry for `addWorker` and a serialized worker list for
/// `deserializeWorkers`. JSON payloads may arrive as a `json` argument or as
/// JSON text.
pub struct WorkerControlHandler {
    workers: Arc<WorkerManager>,
}

impl WorkerControlHandler {
    pub fn new(workers: Arc<WorkerManager>) -> Self {
        Self { workers }
    }
}

fn json_arg(args: &[Arg], index: usize) -> Option<Value> {
    let arg = args.get(index)?;
    match arg.as_json() {
        Some(value) => Some(value.clone()),
        None => serde_json::from_str(arg.as_str()?).ok(),
    }
}

fn bad_request(name: &str) -> Value {
    debug!(name, "malformed worker control call");
    json!({ "error": format!("malformed arguments for {name}") })
}

impl CapabilityHandler for WorkerControlHandler {
    fn handle(&self, name: &str, args: &[Arg]) -> Option<Value> {
        let result = match name {
            "addWorker" => {
                let added = json_arg(args, 1).and_then(|entry| self.workers.deserialize_one(&entry));
                match added {
                    Some(id) => json!({ "id": id }),
                    None => bad_request(name),
                }
            }
            "removeWorker" => match args.get(1).and_then(Arg::as_str) {
                Some(id) => json!({ "removed": self.workers.remove(id) }),
                None => bad_request(name),
            },
            "getWorkerIdentifiers" => json!(self.workers.identifiers()),
            "getWorkerContent" => match args.get(1).and_then(Arg::as_str) {
                Some(id) => json!(self.workers.content(id)),
                None => bad_request(name),
            },
            "serializeWorkers" => self.workers.serialize(),
            "deserializeWorkers" => match json_arg(args, 1) {
                Some(list) => json!(self.workers.deserialize(&list)),
                None => bad_request(name),
            },
            _ => return None,
        };
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marquee_workers::{RecordingBackend, RecordingLog};
    use pretty_assertions::assert_eq;

    fn handler() -> (WorkerControlHandler, Arc<WorkerManager>) {
        let log = RecordingLog::new();
        let workers = Arc::new(WorkerManager::spawn(move || RecordingBackend::new(log)).unwrap());
        (WorkerControlHandler::new(Arc::clone(&workers)), workers)
    }

    #[test]
    fn add_list_and_remove() {
        let (handler, workers) = handler();

        let added = handler
            .handle(
                "addWorker",
                &[
                    Arg::Int(0),
                    Arg::Str(r#"{"id":"w1","content":"<p/>","url":"about:blank"}"#.into()),
                ],
            )
            .unwrap();
        assert_eq!(added, json!({"id": "w1"}));
        assert_eq!(
            handler.handle("getWorkerIdentifiers", &[Arg::Int(0)]),
            Some(json!(["w1"]))
        );
        assert_eq!(
            handler.handle("getWorkerContent", &[Arg::Int(0), Arg::from("w1")]),
            Some(json!("<p/>"))
        );
        assert_eq!(
            handler.handle("removeWorker", &[Arg::Int(0), Arg::from("w1")]),
            Some(json!({"removed": true}))
        );
        assert!(workers.is_empty());
        assert_eq!(
            handler.handle("getWorkerContent", &[Arg::Int(0), Arg::from("w1")]),
            Some(Value::Null)
        );
    }

    #[test]
    fn serialized_lists_round_trip_through_calls() {
        let (handler, _) = handler();
        let list = json!({"a": {"content": "<a/>", "url": "about:blank"}});

        assert_eq!(
            handler.handle("deserializeWorkers", &[Arg::Int(0), Arg::Json(list)]),
            Some(json!(["a"]))
        );
        assert_eq!(
            handler.handle("serializeWorkers", &[Arg::Int(0)]),
            Some(json!({"a": {"id": "a", "content": "<a/>", "url": "about:blank"}}))
        );
    }

    #[test]
    fn malformed_calls_are_answered_with_an_error() {
        let (handler, _) = handler();
        let reply = handler.handle("addWorker", &[Arg::Int(0)]).unwrap();
        assert!(reply.get("error").is_some());
        assert_eq!(handler.handle("getStatus", &[]), None);
    }
}
