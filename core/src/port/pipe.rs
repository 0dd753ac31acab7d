/// Bounded in-process byte pipe
///
/// One reader and one writer move bytes through a fixed-capacity ring buffer.
/// Reads block until data arrives or the pipe is closed; writes block until
/// space frees up or the write deadline passes, in which case the count
/// actually written is returned. A short write is back-pressure, not an error.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default capacity for pipes that are not sized explicitly
pub const DEFAULT_PIPE_CAPACITY: usize = 4096;

/// Errors for pipe operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    #[error("Pipe closed")]
    Closed,
}

struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
}

pub struct BytePipe {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl BytePipe {
    /// Create a pipe holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(PipeState {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes waiting to be read
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().buffer.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Write as much of `data` as fits before `timeout` elapses.
    ///
    /// Returns the number of bytes accepted, which may be short (or zero) when
    /// the reader does not keep up. Fails only if the pipe was closed before
    /// anything was written.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, PipeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let mut written = 0;

        while written < data.len() {
            if state.closed {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(PipeError::Closed)
                };
            }

            let free = self.capacity - state.buffer.len();
            if free == 0 {
                if Instant::now() >= deadline {
                    break;
                }
                self.writable.wait_until(&mut state, deadline);
                continue;
            }

            let n = free.min(data.len() - written);
            state.buffer.extend(&data[written..written + n]);
            written += n;
            self.readable.notify_one();
        }

        Ok(written)
    }

    /// Block until at least one byte is available and copy it into `buf`.
    ///
    /// Returns `Ok(0)` once the pipe is closed (end of stream).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Ok(0);
            }
            if !state.buffer.is_empty() {
                break;
            }
            self.readable.wait(&mut state);
        }

        let n = buf.len().min(state.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(state.buffer.drain(..n)) {
            *slot = byte;
        }
        self.writable.notify_one();
        Ok(n)
    }

    /// Close the pipe, discard buffered bytes and wake every waiter
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.buffer.clear();
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

impl Default for BytePipe {
    fn default() -> Self {
        Self::new(DEFAULT_PIPE_CAPACITY)
    }
}
