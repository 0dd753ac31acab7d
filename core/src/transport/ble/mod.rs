/// BLE (Bluetooth Low Energy) Port Module
///
/// Drives GATT peers on behalf of a byte-stream protocol driver:
///
/// - **gatt**: Device Information characteristics and the peer record
/// - **sentence**: checksum framing for status lines and driver commands
/// - **port**: one connection state machine per peer
/// - **server**: scan-driven aggregate of peer ports
///
/// Radio access goes through the `BleAdapter` trait, so everything here is
/// testable without BLE hardware.

pub mod gatt;
pub mod port;
pub mod sentence;
pub mod server;

pub use gatt::{DeviceInfo, IdentityField, PeerDevice, IDENTITY_SEQUENCE};
pub use port::{BlePort, ConnectionState};
pub use sentence::{DriverCommand, LineReader, StatusSentence};
pub use server::BleServerPort;
