//! Serialized event context
//!
//! Every transport callback (link state, service discovery, attribute reads,
//! scan results) is re-posted here so that all work touching peer state runs
//! on one thread, in order. Delayed tasks run on the same thread.

use parking_lot::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Task),
    Delayed(Duration, Task),
    Shutdown,
}

/// Cloneable handle used to post work onto an `EventLoop`
#[derive(Clone)]
pub struct EventHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl EventHandle {
    /// Queue a task. Returns false if the loop has stopped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Job::Run(Box::new(task))).is_ok()
    }

    /// Queue a task to run after `delay`. Returns false if the loop has stopped.
    pub fn post_delayed<F>(&self, delay: Duration, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Job::Delayed(delay, Box::new(task))).is_ok()
    }

    /// Whether the loop is still accepting work
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A dedicated thread draining a task queue
pub struct EventLoop {
    handle: EventHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawn the event thread
    pub fn start(name: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        match job {
                            Job::Run(task) => task(),
                            Job::Delayed(delay, task) => {
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    task();
                                });
                            }
                            Job::Shutdown => break,
                        }
                    }
                    rx.close();
                });
                debug!("Event loop stopped");
            })?;

        Ok(Self {
            handle: EventHandle { tx },
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> EventHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for the thread. Pending delayed tasks are dropped.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.handle.tx.send(Job::Shutdown);
        if thread.thread().id() == std::thread::current().id() {
            warn!("Event loop shut down from its own thread, not joining");
            return;
        }
        let _ = thread.join();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
