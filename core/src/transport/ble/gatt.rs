/// GATT device identity
///
/// This module holds the Device Information Service characteristics read after
/// every connect, the decoded identity snapshot of a peer, and the peer record
/// holding its discovered attributes.

use crate::transport::abstraction::Attribute;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bluetooth SIG base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// Expand a 16-bit assigned number into a full UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Device Information Service characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityField {
    ManufacturerName,
    ModelNumber,
    SerialNumber,
    HardwareRevision,
    FirmwareRevision,
    SoftwareRevision,
    SystemId,
    PnpId,
}

/// Order in which identity characteristics are read
pub const IDENTITY_SEQUENCE: [IdentityField; 8] = [
    IdentityField::ManufacturerName,
    IdentityField::ModelNumber,
    IdentityField::SerialNumber,
    IdentityField::HardwareRevision,
    IdentityField::FirmwareRevision,
    IdentityField::SoftwareRevision,
    IdentityField::SystemId,
    IdentityField::PnpId,
];

impl IdentityField {
    /// Get characteristic UUID (short form)
    pub fn short_uuid(&self) -> u16 {
        match self {
            IdentityField::ManufacturerName => 0x2A29,
            IdentityField::ModelNumber => 0x2A24,
            IdentityField::SerialNumber => 0x2A25,
            IdentityField::HardwareRevision => 0x2A27,
            IdentityField::FirmwareRevision => 0x2A26,
            IdentityField::SoftwareRevision => 0x2A28,
            IdentityField::SystemId => 0x2A23,
            IdentityField::PnpId => 0x2A50,
        }
    }

    pub fn uuid(&self) -> Uuid {
        uuid_from_u16(self.short_uuid())
    }

    /// Whether the value is an integer rather than a string
    pub fn is_numeric(&self) -> bool {
        matches!(self, IdentityField::SystemId | IdentityField::PnpId)
    }
}

/// Interpret a characteristic value as a NUL-terminated string
pub fn decode_string(value: &[u8]) -> String {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..end]).into_owned()
}

/// Interpret a characteristic value as a little-endian unsigned integer.
/// Anything wider than 8 bytes decodes to 0.
pub fn decode_u64(value: &[u8]) -> u64 {
    if value.len() > 8 {
        return 0;
    }
    value
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i)))
}

/// Identity snapshot of a peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub hardware_revision: String,
    pub firmware_revision: String,
    pub software_revision: String,
    pub system_id: u64,
    pub pnp_id: u64,
}

impl DeviceInfo {
    /// Store a successfully read characteristic value
    pub fn apply(&mut self, field: IdentityField, value: &[u8]) {
        match field {
            IdentityField::ManufacturerName => self.manufacturer = decode_string(value),
            IdentityField::ModelNumber => self.model = decode_string(value),
            IdentityField::SerialNumber => self.serial = decode_string(value),
            IdentityField::HardwareRevision => self.hardware_revision = decode_string(value),
            IdentityField::FirmwareRevision => self.firmware_revision = decode_string(value),
            IdentityField::SoftwareRevision => self.software_revision = decode_string(value),
            IdentityField::SystemId => self.system_id = decode_u64(value),
            IdentityField::PnpId => self.pnp_id = decode_u64(value),
        }
    }
}

/// A connected (or connecting) peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDevice {
    pub address: String,
    pub attributes: Vec<Attribute>,
    pub info: DeviceInfo,
}

impl PeerDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            attributes: Vec::new(),
            info: DeviceInfo::default(),
        }
    }

    /// Replace the attribute set after a completed service discovery
    pub fn set_attributes(&mut self, attributes: Vec<Attribute>) {
        self.attributes.clear();
        self.attributes.extend(attributes);
    }

    /// First discovered attribute with `uuid`
    pub fn find(&self, uuid: &Uuid) -> Option<Attribute> {
        self.attributes.iter().find(|a| a.uuid == *uuid).copied()
    }

    /// Every discovered attribute with `uuid`
    pub fn find_all(&self, uuid: &Uuid) -> Vec<Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.uuid == *uuid)
            .copied()
            .collect()
    }
}
