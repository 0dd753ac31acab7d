// Shared fakes for integration tests
//
// FakeAdapter stands in for the platform radio: it reports scripted peers,
// accepts or refuses connections, and answers GATT requests by invoking the
// event handler directly on the calling thread.

#![allow(dead_code)]

use bleport_core::transport::{
    Attribute, BleAdapter, DiscoveredDevice, GattConnection, GattEvent, GattEventHandler,
    GattStatus, LinkState, ScanHandler, TransportError,
};
use bleport_core::{Config, InputListener};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const MANUFACTURER_UUID: Uuid = Uuid::from_u128(0x00002A29_0000_1000_8000_00805F9B34FB);
pub const MODEL_UUID: Uuid = Uuid::from_u128(0x00002A24_0000_1000_8000_00805F9B34FB);
pub const SERIAL_UUID: Uuid = Uuid::from_u128(0x00002A25_0000_1000_8000_00805F9B34FB);
pub const SYSTEM_ID_UUID: Uuid = Uuid::from_u128(0x00002A23_0000_1000_8000_00805F9B34FB);
pub const DATA_UUID: Uuid = Uuid::from_u128(0xABA27100_143B_4B81_A444_EDCD0000F022);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Short timeouts so timeout paths finish quickly
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.ble.scan_duration_ms = 300;
    config.ble.connect_join_timeout_ms = 300;
    config.ble.attribute_read_timeout_ms = 200;
    config.port.write_timeout_ms = 500;
    config
}

/// Scripted behaviour of one peer
#[derive(Clone)]
pub struct FakePeer {
    pub attributes: Vec<(Uuid, Vec<u8>)>,
    pub connect_ok: bool,
    pub discover_ok: bool,
    /// Block inside `connect` this long before answering
    pub connect_delay: Option<Duration>,
    /// Reads of these report a failed status
    pub failing_reads: Vec<Uuid>,
    /// Reads of these are accepted but never answered
    pub silent_reads: Vec<Uuid>,
}

impl FakePeer {
    pub fn new(attributes: Vec<(Uuid, Vec<u8>)>) -> Self {
        Self {
            attributes,
            connect_ok: true,
            discover_ok: true,
            connect_delay: None,
            failing_reads: Vec::new(),
            silent_reads: Vec::new(),
        }
    }

    /// Manufacturer "Flytec" and model "Sensbox", nothing else
    pub fn flytec() -> Self {
        Self::new(vec![
            (MANUFACTURER_UUID, b"Flytec".to_vec()),
            (MODEL_UUID, b"Sensbox\0".to_vec()),
        ])
    }

    fn attribute_list(&self) -> Vec<Attribute> {
        self.attributes
            .iter()
            .enumerate()
            .map(|(i, (uuid, _))| Attribute::new(*uuid, i as u64 + 1))
            .collect()
    }
}

/// Everything observable about one connection
pub struct FakeLink {
    pub address: String,
    peer: FakePeer,
    handler: GattEventHandler,
    pub reads: Mutex<Vec<Uuid>>,
    pub notifications: Mutex<Vec<(Uuid, bool)>>,
    pub closes: AtomicUsize,
}

impl FakeLink {
    /// Deliver a notification value for `uuid`
    pub fn notify(&self, uuid: Uuid, value: &[u8]) {
        if let Some(attribute) = self.peer.attribute_list().into_iter().find(|a| a.uuid == uuid) {
            (self.handler)(GattEvent::AttributeChanged {
                attribute,
                value: value.to_vec(),
            });
        }
    }

    /// Report link loss
    pub fn drop_link(&self) {
        (self.handler)(GattEvent::ConnectionStateChanged(LinkState::Disconnected));
    }

    pub fn reconnect(&self) {
        (self.handler)(GattEvent::ConnectionStateChanged(LinkState::Connected));
    }
}

struct FakeConnection {
    link: Arc<FakeLink>,
}

impl GattConnection for FakeConnection {
    fn discover_services(&self) -> Result<(), TransportError> {
        let link = &self.link;
        let event = if link.peer.discover_ok {
            GattEvent::ServicesDiscovered {
                status: GattStatus::Success,
                attributes: link.peer.attribute_list(),
            }
        } else {
            GattEvent::ServicesDiscovered {
                status: GattStatus::Failure,
                attributes: Vec::new(),
            }
        };
        (link.handler)(event);
        Ok(())
    }

    fn read_attribute(&self, attribute: &Attribute) -> Result<(), TransportError> {
        let link = &self.link;
        link.reads.lock().push(attribute.uuid);

        if link.peer.silent_reads.contains(&attribute.uuid) {
            return Ok(());
        }
        let value = link
            .peer
            .attributes
            .iter()
            .find(|(uuid, _)| *uuid == attribute.uuid)
            .map(|(_, value)| value.clone());

        let event = match value {
            Some(value) if !link.peer.failing_reads.contains(&attribute.uuid) => {
                GattEvent::AttributeRead {
                    attribute: *attribute,
                    status: GattStatus::Success,
                    value,
                }
            }
            _ => GattEvent::AttributeRead {
                attribute: *attribute,
                status: GattStatus::Failure,
                value: Vec::new(),
            },
        };
        (link.handler)(event);
        Ok(())
    }

    fn set_notification(&self, attribute: &Attribute, enable: bool) -> Result<(), TransportError> {
        self.link.notifications.lock().push((attribute.uuid, enable));
        Ok(())
    }

    fn close(&self) {
        self.link.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeAdapter {
    peers: Mutex<HashMap<String, FakePeer>>,
    links: Mutex<HashMap<String, Arc<FakeLink>>>,
    scan_handler: Mutex<Option<ScanHandler>>,
    pub connects: Mutex<Vec<String>>,
    pub scans_started: AtomicUsize,
    pub scans_stopped: AtomicUsize,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_peer(self: Arc<Self>, address: &str, peer: FakePeer) -> Arc<Self> {
        self.peers.lock().insert(address.to_string(), peer);
        self
    }

    /// Report `address` to the active scan, as the radio would
    pub fn discover(&self, address: &str) {
        let handler = self.scan_handler.lock().clone();
        if let Some(handler) = handler {
            handler(DiscoveredDevice::new(address));
        }
    }

    pub fn link(&self, address: &str) -> Option<Arc<FakeLink>> {
        self.links.lock().get(address).cloned()
    }

    /// Wait for a connection to `address` to be established
    pub fn wait_for_link(&self, address: &str, timeout: Duration) -> Option<Arc<FakeLink>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(link) = self.link(address) {
                return Some(link);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.connects.lock().iter().filter(|a| *a == address).count()
    }
}

impl BleAdapter for FakeAdapter {
    fn start_scan(&self, handler: ScanHandler, _duration: Duration) -> Result<(), TransportError> {
        *self.scan_handler.lock() = Some(handler);
        self.scans_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_scan(&self) {
        self.scan_handler.lock().take();
        self.scans_stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn connect(
        &self,
        address: &str,
        handler: GattEventHandler,
    ) -> Result<Box<dyn GattConnection>, TransportError> {
        self.connects.lock().push(address.to_string());
        let peer = self
            .peers
            .lock()
            .get(address)
            .cloned()
            .unwrap_or_else(|| FakePeer::new(Vec::new()));

        if let Some(delay) = peer.connect_delay {
            std::thread::sleep(delay);
        }
        if !peer.connect_ok {
            return Err(TransportError::ConnectionFailed(address.to_string()));
        }

        let link = Arc::new(FakeLink {
            address: address.to_string(),
            peer,
            handler,
            reads: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.links.lock().insert(address.to_string(), link.clone());
        (link.handler)(GattEvent::ConnectionStateChanged(LinkState::Connected));

        Ok(Box::new(FakeConnection { link }))
    }
}

/// Listener collecting every byte delivered to the driver
#[derive(Default)]
pub struct Collector {
    data: Mutex<Vec<u8>>,
    changed: Condvar,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Complete CRLF-terminated lines received so far
    pub fn lines(&self) -> Vec<String> {
        let text = String::from_utf8_lossy(&self.data.lock()).into_owned();
        let mut lines: Vec<String> = text.split("\r\n").map(str::to_string).collect();
        lines.pop();
        lines
    }

    /// Wait until at least `count` bytes have arrived
    pub fn wait_for_bytes(&self, count: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut data = self.data.lock();
        while data.len() < count {
            if self.changed.wait_until(&mut data, deadline).timed_out() {
                break;
            }
        }
        data.clone()
    }

    /// Wait until at least `count` complete lines have arrived
    pub fn wait_for_lines(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let lines = self.lines();
            if lines.len() >= count || Instant::now() >= deadline {
                return lines;
            }
            let mut data = self.data.lock();
            let _ = self
                .changed
                .wait_for(&mut data, Duration::from_millis(20));
        }
    }
}

impl InputListener for Collector {
    fn data_received(&self, data: &[u8]) {
        self.data.lock().extend_from_slice(data);
        self.changed.notify_all();
    }
}

/// Listener that blocks every delivery until released
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }
}

impl InputListener for Gate {
    fn data_received(&self, _data: &[u8]) {
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }
}

/// Poll `check` until it holds or `timeout` expires
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
