//! Transport abstraction layer
//!
//! The host platform supplies the radio: scanning, connecting and GATT
//! operations. It is consumed here through `BleAdapter` and `GattConnection`
//! and reports back through handler callbacks, which may fire on any thread.

use crate::config::Config;
use crate::events::EventHandle;
use crate::port::PortError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    Unavailable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Attribute read failed: {0}")]
    AttributeReadFailed(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Port error: {0}")]
    Port(#[from] PortError),
}

/// Link-level connection state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Completion status of an asynchronous GATT operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    Failure,
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        *self == GattStatus::Success
    }
}

/// A discovered characteristic: its UUID plus an opaque platform handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub uuid: Uuid,
    pub handle: u64,
}

impl Attribute {
    pub fn new(uuid: Uuid, handle: u64) -> Self {
        Self { uuid, handle }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid.hyphenated())
    }
}

/// Events delivered by a `GattConnection`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged(LinkState),
    ServicesDiscovered {
        status: GattStatus,
        attributes: Vec<Attribute>,
    },
    AttributeRead {
        attribute: Attribute,
        status: GattStatus,
        value: Vec<u8>,
    },
    /// Notification or indication of a new attribute value
    AttributeChanged { attribute: Attribute, value: Vec<u8> },
}

/// A peer reported by a discovery scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Transport address, unique per peer (e.g. "AA:BB:CC:DD:EE:FF")
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: None,
        }
    }
}

pub type ScanHandler = Arc<dyn Fn(DiscoveredDevice) + Send + Sync>;
pub type GattEventHandler = Arc<dyn Fn(GattEvent) + Send + Sync>;

/// Platform BLE adapter
pub trait BleAdapter: Send + Sync {
    /// Start reporting nearby peers to `handler`. The same peer may be
    /// reported many times.
    fn start_scan(&self, handler: ScanHandler, duration_hint: Duration)
        -> Result<(), TransportError>;

    fn stop_scan(&self);

    /// Begin connecting to `address`. Progress is reported to `handler`.
    fn connect(
        &self,
        address: &str,
        handler: GattEventHandler,
    ) -> Result<Box<dyn GattConnection>, TransportError>;
}

/// One platform connection to a peer
pub trait GattConnection: Send + Sync {
    /// Completion arrives as `GattEvent::ServicesDiscovered`
    fn discover_services(&self) -> Result<(), TransportError>;

    /// Completion arrives as `GattEvent::AttributeRead`
    fn read_attribute(&self, attribute: &Attribute) -> Result<(), TransportError>;

    /// Values then arrive as `GattEvent::AttributeChanged`
    fn set_notification(&self, attribute: &Attribute, enable: bool)
        -> Result<(), TransportError>;

    fn close(&self);
}

/// Everything a BLE port needs from the component that assembles it
#[derive(Clone)]
pub struct BleContext {
    pub adapter: Arc<dyn BleAdapter>,
    pub events: EventHandle,
    pub config: Config,
}

impl BleContext {
    pub fn new(adapter: Arc<dyn BleAdapter>, events: EventHandle, config: Config) -> Self {
        Self {
            adapter,
            events,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_display_is_lowercase_hyphenated() {
        let uuid = Uuid::from_u128(0x00002A29_0000_1000_8000_00805F9B34FB);
        let attribute = Attribute::new(uuid, 7);
        assert_eq!(attribute.to_string(), "00002a29-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_gatt_status() {
        assert!(GattStatus::Success.is_success());
        assert!(!GattStatus::Failure.is_success());
    }

    #[test]
    fn test_port_error_converts() {
        let err: TransportError = PortError::Closed.into();
        assert_eq!(err, TransportError::Port(PortError::Closed));
        assert_eq!(err.to_string(), "Port error: Port closed");
    }

    #[test]
    fn test_discovered_device_new() {
        let device = DiscoveredDevice::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(device.address, "AA:BB:CC:DD:EE:FF");
        assert!(device.name.is_none());
    }
}
