// Transport module: platform BLE adapter seam and BLE ports

pub mod abstraction;
pub mod ble;

pub use abstraction::{
    Attribute, BleAdapter, BleContext, DiscoveredDevice, GattConnection, GattEvent,
    GattEventHandler, GattStatus, LinkState, ScanHandler, TransportError,
};
pub use ble::{BlePort, BleServerPort, ConnectionState, DeviceInfo};
