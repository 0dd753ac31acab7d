// Checksum-framed sentences
//
// Status lines injected toward the driver, and command lines written by it,
// share one framing: `$<payload>*<XX>\r\n`, where XX is the uppercase hex XOR
// of every payload byte.

use super::gatt::DeviceInfo;
use std::fmt;
use uuid::Uuid;

/// Longest line accepted from the driver before the buffer is discarded
pub const MAX_COMMAND_LINE: usize = 256;

/// XOR of all payload bytes
pub fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame a payload as `$<payload>*<XX>\r\n`
pub fn frame(payload: &str) -> String {
    format!("${}*{:02X}\r\n", payload, checksum(payload))
}

/// Check a framed line and return its payload.
///
/// Accepts the line with or without its trailing CR/LF. Returns `None` if the
/// framing is malformed or the checksum does not match.
pub fn verify(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let body = line.strip_prefix('$')?;
    let (payload, sum) = body.rsplit_once('*')?;
    if sum.len() != 2 {
        return None;
    }
    let expected = u8::from_str_radix(sum, 16).ok()?;
    (checksum(payload) == expected).then_some(payload)
}

/// Status sentences emitted by a BLE port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSentence<'a> {
    /// Link to the peer is up
    Connect { address: &'a str },
    /// One discovered characteristic
    Discover { address: &'a str, uuid: Uuid },
    /// Identity read sequence finished
    Info { info: &'a DeviceInfo },
}

impl StatusSentence<'_> {
    pub fn payload(&self) -> String {
        match self {
            StatusSentence::Connect { address } => format!("BLECONNECT,{}", address),
            StatusSentence::Discover { address, uuid } => {
                format!("BLEDISCOVER,{},{}", address, uuid.hyphenated())
            }
            StatusSentence::Info { info } => format!(
                "BLEINFO,{},{},{},{},{},{},{},{}",
                info.manufacturer,
                info.model,
                info.serial,
                info.hardware_revision,
                info.firmware_revision,
                info.software_revision,
                info.system_id,
                info.pnp_id
            ),
        }
    }

    /// The complete framed line
    pub fn to_line(&self) -> String {
        frame(&self.payload())
    }
}

impl fmt::Display for StatusSentence<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.payload())
    }
}

/// Commands a driver may send to a BLE port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    /// `BLESTRNOTI,<uuid>`
    StartNotify(Uuid),
    /// `BLESTOPNOTI,<uuid>`
    StopNotify(Uuid),
}

impl DriverCommand {
    /// Parse a verified payload
    pub fn parse(payload: &str) -> Option<Self> {
        let mut fields = payload.split(',');
        let kind = fields.next()?;
        let uuid = parse_uuid(fields.next()?)?;
        if fields.next().is_some() {
            return None;
        }
        match kind {
            "BLESTRNOTI" => Some(DriverCommand::StartNotify(uuid)),
            "BLESTOPNOTI" => Some(DriverCommand::StopNotify(uuid)),
            _ => None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            DriverCommand::StartNotify(uuid) | DriverCommand::StopNotify(uuid) => *uuid,
        }
    }
}

/// Parse a UUID written with any dash grouping (8-4-4-4-12, 8-8-8-8 or none)
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let digits: String = text.trim().chars().filter(|c| *c != '-').collect();
    if digits.len() != 32 {
        return None;
    }
    Uuid::try_parse(&digits).ok()
}

/// Splits a byte stream into lines
#[derive(Debug, Default)]
pub struct LineReader {
    buffer: Vec<u8>,
    /// Inside an overlong line, skipping to its terminator
    discarding: bool,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and collect every line completed by them, without the
    /// line terminator. Overlong lines are discarded.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match byte {
                b'\n' | b'\r' => {
                    if self.discarding {
                        self.discarding = false;
                    } else if !self.buffer.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    }
                    self.buffer.clear();
                }
                _ if self.discarding => {}
                _ if self.buffer.len() >= MAX_COMMAND_LINE => {
                    self.buffer.clear();
                    self.discarding = true;
                }
                _ => self.buffer.push(byte),
            }
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
