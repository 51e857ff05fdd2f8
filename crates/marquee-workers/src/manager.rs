use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use marquee_bus::{ConnectionId, DestinationFlags, MessageBus};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::RenderExecutor;
use crate::renderer::{RenderError, RendererBackend, RendererInstance, WorkerSpec};

pub const DEFAULT_RENDER_THREAD: &str = "marquee-render";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no worker with id {0}")]
    Unknown(String),
    #[error("worker {0} failed to start")]
    Failed(String),
    #[error("worker {0} was not ready in time")]
    TimedOut(String),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Lifecycle of a worker's renderer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Recorded; the render thread has not built the instance yet.
    Pending,
    Ready,
    Failed,
}

/// Serialized form of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_load_script: Option<String>,
}

impl WorkerEntry {
    /// Reads an entry, requiring only string `content` and `url`.
    ///
    /// The script is taken from `onLoadScript` or the legacy
    /// `executeJavaScriptOnLoad`, whichever holds a string. Values of any
    /// other type are ignored rather than failing the entry.
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_owned);
        Some(Self {
            id: text("id"),
            content: text("content")?,
            url: text("url")?,
            on_load_script: text("onLoadScript").or_else(|| text("executeJavaScriptOnLoad")),
        })
    }

    fn into_spec(self) -> WorkerSpec {
        WorkerSpec {
            content: self.content,
            url: self.url,
            on_load_script: self.on_load_script.filter(|script| !script.is_empty()),
        }
    }
}

struct WorkerRecord {
    spec: WorkerSpec,
    state: WorkerState,
    generation: u64,
    connection: ConnectionId,
}

#[derive(Default)]
struct Registry {
    workers: BTreeMap<String, WorkerRecord>,
    next_generation: u64,
}

struct Shared {
    registry: Mutex<Registry>,
    ready: Condvar,
    bus: Option<Arc<MessageBus>>,
}

impl Shared {
    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.registry
            .lock()
            .workers
            .get(id)
            .is_some_and(|record| record.generation == generation)
    }

    /// Drops a record that never reached the render thread.
    fn discard(&self, id: &str, generation: u64) {
        let mut registry = self.registry.lock();
        if registry
            .workers
            .get(id)
            .is_some_and(|record| record.generation == generation)
        {
            registry.workers.remove(id);
        }
        drop(registry);
        self.ready.notify_all();
    }

    fn settle(&self, id: &str, generation: u64, state: WorkerState) {
        let mut registry = self.registry.lock();
        if let Some(record) = registry.workers.get_mut(id) {
            if record.generation == generation {
                record.state = state;
            }
        }
        drop(registry);
        self.ready.notify_all();
    }
}

struct LiveInstance {
    instance: Box<dyn RendererInstance>,
    generation: u64,
    connection: ConnectionId,
}

/// Render-thread side of the manager: the backend and every live instance.
struct RenderState {
    backend: Box<dyn RendererBackend>,
    instances: HashMap<String, LiveInstance>,
}

impl RenderState {
    fn create(
        &mut self,
        shared: &Shared,
        id: String,
        spec: WorkerSpec,
        generation: u64,
        connection: ConnectionId,
    ) {
        // Removed or replaced before the render thread got to it.
        if !shared.is_current(&id, generation) {
            debug!(%id, "skipping creation of a removed worker");
            return;
        }

        match self.backend.create(&id, &spec) {
            Ok(instance) => {
                if let (Some(bus), Some(recipient)) = (&shared.bus, instance.recipient()) {
                    bus.add_listener(connection, DestinationFlags::WORKER, recipient);
                }
                self.instances.insert(
                    id.clone(),
                    LiveInstance {
                        instance,
                        generation,
                        connection,
                    },
                );
                debug!(%id, "worker ready");
                shared.settle(&id, generation, WorkerState::Ready);
            }
            Err(err) => {
                warn!(%id, %err, "worker creation failed");
                shared.settle(&id, generation, WorkerState::Failed);
            }
        }
    }

    fn destroy(&mut self, shared: &Shared, id: &str, generation: u64) {
        let matches = self
            .instances
            .get(id)
            .is_some_and(|live| live.generation == generation);
        if !matches {
            return;
        }
        if let Some(live) = self.instances.remove(id) {
            if let Some(bus) = &shared.bus {
                bus.remove_listener(live.connection);
            }
            self.backend.destroy(id, live.instance);
            debug!(%id, "worker destroyed");
        }
    }

    /// Destroys every instance whose worker is no longer registered.
    fn destroy_all(&mut self, shared: &Shared) {
        let stale: Vec<String> = self
            .instances
            .iter()
            .filter(|(id, live)| !shared.is_current(id, live.generation))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(live) = self.instances.remove(&id) {
                if let Some(bus) = &shared.bus {
                    bus.remove_listener(live.connection);
                }
                self.backend.destroy(&id, live.instance);
            }
        }
    }
}

/// Configures a [`WorkerManager`].
#[derive(Default)]
pub struct WorkerManagerBuilder {
    bus: Option<Arc<MessageBus>>,
    thread_name: Option<String>,
}

impl WorkerManagerBuilder {
    /// Registers every worker whose instance exposes a recipient as a
    /// `WORKER` listener on `bus`.
    pub fn bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Starts the render thread; `factory` builds the backend on it.
    pub fn spawn<F, B>(self, factory: F) -> Result<WorkerManager, WorkerError>
    where
        F: FnOnce() -> B + Send + 'static,
        B: RendererBackend + 'static,
    {
        let name = self
            .thread_name
            .unwrap_or_else(|| DEFAULT_RENDER_THREAD.to_string());
        let executor = RenderExecutor::spawn(&name, move || RenderState {
            backend: Box::new(factory()),
            instances: HashMap::new(),
        })?;

        Ok(WorkerManager {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                ready: Condvar::new(),
                bus: self.bus,
            }),
            executor,
        })
    }
}

/// Named collection of headless renderer instances.
///
/// Records are kept here; the instances themselves are built and destroyed
/// on the render thread. `add` returns as soon as the record exists and
/// [`WorkerManager::wait_ready`] observes the instance coming up.
pub struct WorkerManager {
    shared: Arc<Shared>,
    executor: RenderExecutor<RenderState>,
}

impl WorkerManager {
    pub fn builder() -> WorkerManagerBuilder {
        WorkerManagerBuilder::default()
    }

    pub fn spawn<F, B>(factory: F) -> Result<Self, WorkerError>
    where
        F: FnOnce() -> B + Send + 'static,
        B: RendererBackend + 'static,
    {
        Self::builder().spawn(factory)
    }

    /// Adds a worker and returns its id.
    ///
    /// An empty or already used `id` is replaced with a fresh one. An empty
    /// `on_load_script` means none. After [`WorkerManager::shutdown`] nothing
    /// is recorded and the returned id is unknown to the manager.
    pub fn add(&self, id: &str, content: &str, url: &str, on_load_script: &str) -> String {
        let spec = WorkerSpec {
            content: content.to_string(),
            url: url.to_string(),
            on_load_script: (!on_load_script.is_empty()).then(|| on_load_script.to_string()),
        };
        self.add_spec(id, spec)
    }

    pub fn add_spec(&self, id: &str, spec: WorkerSpec) -> String {
        let connection = ConnectionId::next();
        let (id, generation) = {
            let mut registry = self.shared.registry.lock();
            let id = if id.is_empty() || registry.workers.contains_key(id) {
                Uuid::new_v4().to_string()
            } else {
                id.to_string()
            };
            registry.next_generation += 1;
            let generation = registry.next_generation;
            registry.workers.insert(
                id.clone(),
                WorkerRecord {
                    spec: spec.clone(),
                    state: WorkerState::Pending,
                    generation,
                    connection,
                },
            );
            (id, generation)
        };

        let shared = Arc::clone(&self.shared);
        let task_id = id.clone();
        let posted = self.executor.post(move |state| {
            state.create(&shared, task_id, spec, generation, connection)
        });
        if !posted {
            warn!(%id, "render thread is gone, worker not added");
            self.shared.discard(&id, generation);
            return id;
        }
        info!(%id, "worker added");
        id
    }

    /// Removes a worker; returns `false` if there was none.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.shared.registry.lock().workers.remove(id);
        let Some(record) = removed else {
            return false;
        };
        self.shared.ready.notify_all();
        if let Some(bus) = &self.shared.bus {
            bus.remove_listener(record.connection);
        }

        let shared = Arc::clone(&self.shared);
        let id = id.to_string();
        let generation = record.generation;
        self.executor
            .post(move |state| state.destroy(&shared, &id, generation));
        true
    }

    pub fn remove_all(&self) {
        let removed = std::mem::take(&mut self.shared.registry.lock().workers);
        self.shared.ready.notify_all();
        if let Some(bus) = &self.shared.bus {
            for record in removed.values() {
                bus.remove_listener(record.connection);
            }
        }
        let shared = Arc::clone(&self.shared);
        self.executor.post(move |state| state.destroy_all(&shared));
        debug!(count = removed.len(), "all workers removed");
    }

    pub fn content(&self, id: &str) -> Option<String> {
        self.shared
            .registry
            .lock()
            .workers
            .get(id)
            .map(|record| record.spec.content.clone())
    }

    pub fn spec(&self, id: &str) -> Option<WorkerSpec> {
        self.shared
            .registry
            .lock()
            .workers
            .get(id)
            .map(|record| record.spec.clone())
    }

    /// Ids of every worker, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        self.shared.registry.lock().workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.registry.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, id: &str) -> Option<WorkerState> {
        self.shared
            .registry
            .lock()
            .workers
            .get(id)
            .map(|record| record.state)
    }

    /// Blocks until the worker's instance exists, its creation failed, or
    /// `timeout` elapses.
    pub fn wait_ready(&self, id: &str, timeout: Duration) -> Result<(), WorkerError> {
        let deadline = Instant::now() + timeout;
        let mut registry = self.shared.registry.lock();
        loop {
            match registry.workers.get(id).map(|record| record.state) {
                None => return Err(WorkerError::Unknown(id.to_string())),
                Some(WorkerState::Ready) => return Ok(()),
                Some(WorkerState::Failed) => return Err(WorkerError::Failed(id.to_string())),
                Some(WorkerState::Pending) => {
                    if Instant::now() >= deadline {
                        return Err(WorkerError::TimedOut(id.to_string()));
                    }
                    self.shared.ready.wait_until(&mut registry, deadline);
                }
            }
        }
    }

    /// `{ id: { id, content, url, onLoadScript } }` for every worker.
    pub fn serialize(&self) -> Value {
        let registry = self.shared.registry.lock();
        let map: Map<String, Value> = registry
            .workers
            .iter()
            .filter_map(|(id, record)| Some((id.clone(), entry_value(id, &record.spec)?)))
            .collect();
        Value::Object(map)
    }

    pub fn serialize_one(&self, id: &str) -> Option<Value> {
        let registry = self.shared.registry.lock();
        let record = registry.workers.get(id)?;
        entry_value(id, &record.spec)
    }

    /// Re-adds every entry of a [`WorkerManager::serialize`] object and
    /// returns the resulting ids. Ids come from the object keys; entries
    /// missing `content` or `url` are skipped.
    pub fn deserialize(&self, input: &Value) -> Vec<String> {
        let Some(entries) = input.as_object() else {
            warn!("worker list is not a JSON object");
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|(key, value)| {
                let mut entry = parse_entry(value)?;
                entry.id = Some(key.clone());
                Some(self.add_entry(entry))
            })
            .collect()
    }

    /// Adds a single `{ id?, content, url, onLoadScript? }` entry.
    pub fn deserialize_one(&self, input: &Value) -> Option<String> {
        parse_entry(input).map(|entry| self.add_entry(entry))
    }

    /// Destroys every worker and stops the render thread. Idempotent.
    pub fn shutdown(&self) {
        if !self.executor.is_running() {
            return;
        }
        self.remove_all();
        self.executor.shutdown();
        info!("worker manager shut down");
    }

    fn add_entry(&self, entry: WorkerEntry) -> String {
        let id = entry.id.clone().unwrap_or_default();
        self.add_spec(&id, entry.into_spec())
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn entry_value(id: &str, spec: &WorkerSpec) -> Option<Value> {
    let entry = WorkerEntry {
        id: Some(id.to_string()),
        content: spec.content.clone(),
        url: spec.url.clone(),
        on_load_script: spec.on_load_script.clone(),
    };
    serde_json::to_value(entry).ok()
}

fn parse_entry(value: &Value) -> Option<WorkerEntry> {
    let entry = WorkerEntry::from_value(value);
    if entry.is_none() {
        debug!("skipping worker entry without string content and url");
    }
    entry
}
