//! In-process port connecting a protocol driver to a transport
//!
//! Two pipes and four workers sit between the driver and the transport:
//!
//! ```text
//! driver write ─> output worker ─> receive pipe ─> receive worker ─> transport listener
//! transport send ─> send worker ─> input pipe ─> input worker ─> driver listener
//! ```
//!
//! The driver sees a plain blocking byte stream no matter how the transport
//! produces its data.

use super::pipe::BytePipe;
use super::worker::{InputWorker, OutputWorker};
use super::{listener_slot, InputListener, Port, PortError, PortState};
use crate::config::PortConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Take a worker out of its slot so it is closed at most once
fn steal<T>(slot: &Mutex<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.lock().take()
}

fn current<T>(slot: &Mutex<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.lock().clone()
}

pub struct MemoryPort {
    name: String,
    /// Driver writes land here and travel to the transport
    output: Mutex<Option<Arc<OutputWorker>>>,
    /// Transport sends land here and travel to the driver
    send: Mutex<Option<Arc<OutputWorker>>>,
    /// Delivers transport bytes to the driver listener
    input: Mutex<Option<Arc<InputWorker>>>,
    /// Delivers driver bytes to the transport listener
    receive: Mutex<Option<Arc<InputWorker>>>,
}

impl MemoryPort {
    /// Create the pipes and start all four workers
    pub fn new(name: &str, config: &PortConfig) -> Result<Self, PortError> {
        let input_pipe = Arc::new(BytePipe::new(config.input_buffer_size));
        let receive_pipe = Arc::new(BytePipe::new(config.receive_buffer_size));
        let timeout = config.write_timeout();

        let receive = InputWorker::spawn(
            &format!("mem{}", name),
            receive_pipe.clone(),
            listener_slot(None),
        )?;
        let send = OutputWorker::spawn(
            &format!("mem{}", name),
            input_pipe.clone(),
            config.output_buffer_size,
            timeout,
        )?;
        let input = InputWorker::spawn(name, input_pipe, listener_slot(None))?;
        let output = OutputWorker::spawn(name, receive_pipe, config.output_buffer_size, timeout)?;

        debug!("{}: memory port started", name);

        Ok(Self {
            name: name.to_string(),
            output: Mutex::new(Some(Arc::new(output))),
            send: Mutex::new(Some(Arc::new(send))),
            input: Mutex::new(Some(Arc::new(input))),
            receive: Mutex::new(Some(Arc::new(receive))),
        })
    }

    /// Install the listener that receives bytes written by the driver
    pub fn set_transport_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        if let Some(receive) = current(&self.receive) {
            receive.set_listener(listener);
        }
    }

    /// Push transport-originated bytes toward the driver
    pub fn send(&self, data: &[u8]) -> Result<usize, PortError> {
        match current(&self.send) {
            Some(send) => send.write(data),
            None => Err(PortError::Closed),
        }
    }

    /// Adjust how long `send` may block on a full buffer
    pub fn set_write_timeout(&self, timeout: Duration) {
        if let Some(send) = current(&self.send) {
            send.set_timeout(timeout);
        }
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> PortState {
        match current(&self.input) {
            Some(input) if input.is_valid() => PortState::Ready,
            _ => PortState::Failed,
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        match current(&self.output) {
            Some(output) => output.write(data),
            None => Err(PortError::Closed),
        }
    }

    fn drain(&self) -> bool {
        current(&self.output).map_or(false, |output| output.drain())
    }

    fn close(&self) {
        if let Some(output) = steal(&self.output) {
            output.close();
        }
        if let Some(send) = steal(&self.send) {
            send.close();
        }
        if let Some(input) = steal(&self.input) {
            input.close();
        }
        if let Some(receive) = steal(&self.receive) {
            receive.close();
            debug!("{}: memory port closed", self.name);
        }
    }

    fn set_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        if let Some(input) = current(&self.input) {
            input.set_listener(listener);
        }
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        self.close();
    }
}
