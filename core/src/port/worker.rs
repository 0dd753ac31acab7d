/// Worker loops moving bytes between pipes and their endpoints
///
/// An `InputWorker` reads a pipe and hands every chunk to a listener. An
/// `OutputWorker` accepts writes into a staging buffer and forwards them into
/// a pipe from its own thread, so that writers never wait on the reader
/// directly. Each worker owns exactly one thread, released by `close`.

use super::pipe::BytePipe;
use super::{ListenerSlot, PortError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Largest chunk handed to a listener or forwarded to a pipe at once
pub const CHUNK_SIZE: usize = 1024;

fn join_worker(name: &str, thread: JoinHandle<()>) {
    if thread.thread().id() == std::thread::current().id() {
        debug!("{}: worker closed from its own thread", name);
        return;
    }
    if thread.join().is_err() {
        warn!("{}: worker thread panicked", name);
    }
}

// ============================================================================
// INPUT WORKER
// ============================================================================

pub struct InputWorker {
    name: String,
    source: Arc<BytePipe>,
    listener: ListenerSlot,
    valid: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InputWorker {
    /// Start reading `source`, delivering to whatever listener `listener` holds
    pub fn spawn(
        name: &str,
        source: Arc<BytePipe>,
        listener: ListenerSlot,
    ) -> Result<Self, PortError> {
        let valid = Arc::new(AtomicBool::new(true));

        let thread = {
            let name = name.to_string();
            let source = source.clone();
            let listener = listener.clone();
            let valid = valid.clone();
            std::thread::Builder::new()
                .name(format!("{}-in", name))
                .spawn(move || {
                    let mut buf = vec![0u8; CHUNK_SIZE];
                    loop {
                        let n = match source.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        let current = listener.read().clone();
                        match current {
                            Some(listener) => listener.data_received(&buf[..n]),
                            None => trace!("{}: no listener, dropping {} bytes", name, n),
                        }
                    }
                    valid.store(false, Ordering::SeqCst);
                    debug!("{}: input worker finished", name);
                })
                .map_err(|e| PortError::WorkerSpawn(e.to_string()))?
        };

        Ok(Self {
            name: name.to_string(),
            source,
            listener,
            valid,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn super::InputListener>>) {
        *self.listener.write() = listener;
    }

    /// Whether the read loop is still running
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Close the source pipe and wait for the loop to exit
    pub fn close(&self) {
        self.source.close();
        if let Some(thread) = self.thread.lock().take() {
            join_worker(&self.name, thread);
        }
    }
}

// ============================================================================
// OUTPUT WORKER
// ============================================================================

struct OutputState {
    buffer: VecDeque<u8>,
    in_flight: bool,
    closed: bool,
}

struct OutputShared {
    name: String,
    state: Mutex<OutputState>,
    changed: Condvar,
    capacity: usize,
    timeout_ms: AtomicU64,
    sink: Arc<BytePipe>,
}

impl OutputShared {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn run(&self) {
        loop {
            let chunk: Vec<u8> = {
                let mut state = self.state.lock();
                while state.buffer.is_empty() && !state.closed {
                    self.changed.wait(&mut state);
                }
                if state.closed {
                    break;
                }
                let n = state.buffer.len().min(CHUNK_SIZE);
                state.in_flight = true;
                state.buffer.drain(..n).collect()
            };

            let result = self.sink.write(&chunk, self.timeout());

            let mut state = self.state.lock();
            state.in_flight = false;
            match result {
                Ok(n) if n < chunk.len() => {
                    warn!(
                        "{}: reader too slow, dropped {} of {} bytes",
                        self.name,
                        chunk.len() - n,
                        chunk.len()
                    );
                }
                Ok(_) => {}
                Err(_) => {
                    debug!("{}: sink closed", self.name);
                    state.closed = true;
                    state.buffer.clear();
                }
            }
            self.changed.notify_all();
            if state.closed {
                break;
            }
        }
        debug!("{}: output worker finished", self.name);
    }
}

pub struct OutputWorker {
    shared: Arc<OutputShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OutputWorker {
    /// Start forwarding staged writes into `sink`
    pub fn spawn(
        name: &str,
        sink: Arc<BytePipe>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<Self, PortError> {
        let shared = Arc::new(OutputShared {
            name: name.to_string(),
            state: Mutex::new(OutputState {
                buffer: VecDeque::with_capacity(capacity),
                in_flight: false,
                closed: false,
            }),
            changed: Condvar::new(),
            capacity: capacity.max(1),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            sink,
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("{}-out", name))
                .spawn(move || shared.run())
                .map_err(|e| PortError::WorkerSpawn(e.to_string()))?
        };

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.shared
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Stage `data`, waiting up to the write timeout for room.
    ///
    /// Returns the number of bytes staged, possibly fewer than requested.
    pub fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.timeout();
        let mut state = shared.state.lock();
        let mut written = 0;

        while written < data.len() {
            if state.closed {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(PortError::Closed)
                };
            }

            let free = shared.capacity.saturating_sub(state.buffer.len());
            if free == 0 {
                if Instant::now() >= deadline {
                    break;
                }
                shared.changed.wait_until(&mut state, deadline);
                continue;
            }

            let n = free.min(data.len() - written);
            state.buffer.extend(&data[written..written + n]);
            written += n;
            shared.changed.notify_all();
        }

        if written < data.len() {
            warn!(
                "{}: write timed out, {} of {} bytes accepted",
                shared.name,
                written,
                data.len()
            );
        }
        Ok(written)
    }

    /// Block until the staging buffer has been handed to the sink.
    /// Returns false if the worker closed first.
    pub fn drain(&self) -> bool {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        while (!state.buffer.is_empty() || state.in_flight) && !state.closed {
            shared.changed.wait(&mut state);
        }
        !state.closed
    }

    /// Stop the loop, close the sink and wait for the thread
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.changed.notify_all();
        }
        self.shared.sink.close();
        if let Some(thread) = self.thread.lock().take() {
            join_worker(&self.shared.name, thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{listener_slot, InputListener};
    use std::sync::mpsc;

    #[test]
    fn test_input_worker_delivers_to_listener() {
        let pipe = Arc::new(BytePipe::new(64));
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let tx = Mutex::new(tx);
        let listener: Arc<dyn InputListener> = Arc::new(move |data: &[u8]| {
            let _ = tx.lock().send(data.to_vec());
        });

        let worker =
            InputWorker::spawn("test", pipe.clone(), listener_slot(Some(listener))).expect("Spawn");
        pipe.write(b"ping", Duration::from_millis(10)).expect("Write");

        let received = rx.recv_timeout(Duration::from_secs(1)).expect("Delivered");
        assert_eq!(received, b"ping");
        assert!(worker.is_valid());

        worker.close();
        assert!(!worker.is_valid());
        worker.close();
    }

    #[test]
    fn test_input_worker_without_listener_drops() {
        let pipe = Arc::new(BytePipe::new(64));
        let worker = InputWorker::spawn("test", pipe.clone(), listener_slot(None)).expect("Spawn");
        pipe.write(b"lost", Duration::from_millis(10)).expect("Write");
        std::thread::sleep(Duration::from_millis(50));

        assert!(pipe.is_empty());
        worker.close();
    }

    #[test]
    fn test_output_worker_forwards_and_drains() {
        let sink = Arc::new(BytePipe::new(64));
        let worker =
            OutputWorker::spawn("test", sink.clone(), 16, Duration::from_millis(100)).expect("Spawn");

        assert_eq!(worker.write(b"hello"), Ok(5));
        assert!(worker.drain());

        let mut buf = [0u8; 16];
        let n = sink.read(&mut buf).expect("Read");
        assert_eq!(&buf[..n], b"hello");
        worker.close();
    }

    #[test]
    fn test_output_worker_write_after_close() {
        let sink = Arc::new(BytePipe::new(64));
        let worker =
            OutputWorker::spawn("test", sink.clone(), 16, Duration::from_millis(100)).expect("Spawn");
        worker.close();
        worker.close();

        assert_eq!(worker.write(b"late"), Err(PortError::Closed));
        assert!(!worker.drain());
        assert!(sink.is_closed());
    }

    #[test]
    fn test_output_worker_drops_when_sink_stalls() {
        let sink = Arc::new(BytePipe::new(4));
        let worker =
            OutputWorker::spawn("test", sink.clone(), 64, Duration::from_millis(30)).expect("Spawn");

        assert_eq!(worker.write(b"0123456789"), Ok(10));
        assert!(worker.drain());
        assert_eq!(sink.len(), 4);
        worker.close();
    }
}
