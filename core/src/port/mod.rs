//! Port contract shared by every byte-stream port
//!
//! A port is what a protocol driver talks to: it writes bytes, drains them,
//! and receives inbound bytes through an `InputListener`. Memory ports, BLE
//! peer ports and the aggregate BLE server port all implement `Port`.

pub mod memory;
pub mod multi;
pub mod pipe;
pub mod worker;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryPort;
pub use multi::MultiPort;
pub use pipe::{BytePipe, PipeError};
pub use worker::{InputWorker, OutputWorker};

/// Externally visible port state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    /// Usable
    Ready,
    /// The transport link has not been established yet
    Limbo,
    /// Permanently unusable
    Failed,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Ready => write!(f, "Ready"),
            PortState::Limbo => write!(f, "Limbo"),
            PortState::Failed => write!(f, "Failed"),
        }
    }
}

/// Errors surfaced across the port contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Port closed")]
    Closed,
    #[error("Failed to spawn port worker: {0}")]
    WorkerSpawn(String),
}

impl From<PipeError> for PortError {
    fn from(err: PipeError) -> Self {
        match err {
            PipeError::Closed => PortError::Closed,
        }
    }
}

/// Receives bytes arriving on a port
pub trait InputListener: Send + Sync {
    fn data_received(&self, data: &[u8]);
}

impl<F> InputListener for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn data_received(&self, data: &[u8]) {
        self(data)
    }
}

/// Listener cell shared between a port and the worker delivering its input
pub type ListenerSlot = Arc<RwLock<Option<Arc<dyn InputListener>>>>;

pub fn listener_slot(listener: Option<Arc<dyn InputListener>>) -> ListenerSlot {
    Arc::new(RwLock::new(listener))
}

/// Byte-stream port as seen by a protocol driver
pub trait Port: Send + Sync {
    /// Name used in logs; for peer ports this is the peer address
    fn name(&self) -> &str;

    fn state(&self) -> PortState;

    /// Queue bytes for the transport.
    ///
    /// Returns how many bytes were accepted; a short count is back-pressure.
    /// `Err(PortError::Closed)` once the port is closing.
    fn write(&self, data: &[u8]) -> Result<usize, PortError>;

    /// Wait until everything written so far has been handed on.
    /// Returns false if the port can no longer flush.
    fn drain(&self) -> bool;

    /// Release every worker. Idempotent.
    fn close(&self);

    fn set_listener(&self, listener: Option<Arc<dyn InputListener>>);

    fn set_baud_rate(&self, _baud: u32) -> bool {
        true
    }

    fn baud_rate(&self) -> u32 {
        0
    }
}
