use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::renderer::RenderError;

type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Single named thread owning a context of type `C`.
///
/// The context is built on the thread by a factory and never leaves it, so
/// `C` need not be `Send`; every other thread reaches it by posting tasks.
/// Tasks run one at a time in posting order.
pub struct RenderExecutor<C> {
    sender: Mutex<Option<Sender<Task<C>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<C: 'static> RenderExecutor<C> {
    pub fn spawn<F>(name: &str, factory: F) -> Result<Self, RenderError>
    where
        F: FnOnce() -> C + Send + 'static,
    {
        let (sender, receiver) = unbounded::<Task<C>>();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut context = factory();
                for task in receiver.iter() {
                    if panic::catch_unwind(AssertUnwindSafe(|| task(&mut context))).is_err() {
                        warn!("render task panicked");
                    }
                }
                debug!("render thread finished");
            })
            .map_err(RenderError::Spawn)?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Queues `task`; returns `false` once the executor has shut down.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Queues `task` and returns a handle to its result.
    ///
    /// Waiting on the handle from the render thread itself never completes.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.post(move |context| {
            let _ = tx.send(task(context));
        });
        TaskHandle { rx }
    }

    pub fn is_render_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stops accepting tasks, runs the ones already queued and joins the
    /// thread. Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if self.is_render_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("render thread panicked");
            }
        }
    }
}

impl<C> Drop for RenderExecutor<C> {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            if thread::current().id() != self.thread_id {
                let _ = handle.join();
            }
        }
    }
}

/// Result of a task submitted to a [`RenderExecutor`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    pub fn wait(self) -> Result<T, RenderError> {
        self.rx.recv().map_err(|_| RenderError::ExecutorClosed)
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, RenderError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RenderError::TimedOut,
            RecvTimeoutError::Disconnected => RenderError::ExecutorClosed,
        })
    }
}
