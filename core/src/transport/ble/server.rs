//! BLE server port
//!
//! Scans for peers and opens one `BlePort` per distinct address, presenting
//! all of them to the driver as a single port. Scanning stops on its own after
//! the configured duration; peers found until then stay connected.

use super::port::BlePort;
use crate::port::{InputListener, MultiPort, Port, PortError, PortState};
use crate::transport::abstraction::{BleContext, DiscoveredDevice, ScanHandler, TransportError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct ServerShared {
    ports: MultiPort,
    context: BleContext,
    scanning: AtomicBool,
    /// Bumped on every scan start so a stale stop timer is ignored
    scan_generation: AtomicU64,
}

impl ServerShared {
    fn on_device_found(&self, device: DiscoveredDevice) {
        if self.ports.state() == PortState::Failed {
            return;
        }

        let address = device.address.clone();
        let created = self.ports.insert_with(&address, || {
            BlePort::new(&address, &self.context).map(|port| Arc::new(port) as Arc<dyn Port>)
        });

        match created {
            Ok(true) => info!(
                "Found BLE device {} ({})",
                address,
                device.name.as_deref().unwrap_or("unnamed")
            ),
            Ok(false) => debug!("BLE device {} already known", address),
            Err(e) => warn!("Could not open port for {}: {}", address, e),
        }
    }

    fn stop_scan(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.context.adapter.stop_scan();
            info!("BLE scan stopped ({} devices)", self.ports.len());
        }
    }
}

/// Aggregate port over every peer found by a scan
pub struct BleServerPort {
    shared: Arc<ServerShared>,
}

impl BleServerPort {
    pub fn new(context: BleContext) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                ports: MultiPort::new("ble-server"),
                context,
                scanning: AtomicBool::new(false),
                scan_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Create the server port and start scanning right away
    pub fn open(context: BleContext) -> Result<Self, TransportError> {
        let server = Self::new(context);
        server.start_scan()?;
        Ok(server)
    }

    /// Start (or restart) a scan; it stops after the configured scan duration
    pub fn start_scan(&self) -> Result<(), TransportError> {
        let shared = &self.shared;
        if shared.ports.state() == PortState::Failed {
            return Err(TransportError::Closed);
        }

        let weak: Weak<ServerShared> = Arc::downgrade(shared);
        let events = shared.context.events.clone();
        let handler: ScanHandler = Arc::new(move |device: DiscoveredDevice| {
            let weak = weak.clone();
            events.post(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_device_found(device);
                }
            });
        });

        let duration = shared.context.config.ble.scan_duration();
        let generation = shared.scan_generation.fetch_add(1, Ordering::SeqCst) + 1;
        shared.scanning.store(true, Ordering::SeqCst);

        if let Err(e) = shared.context.adapter.start_scan(handler, duration) {
            shared.scanning.store(false, Ordering::SeqCst);
            warn!("BLE scan failed to start: {}", e);
            return Err(e);
        }
        info!("BLE scan started for {:?}", duration);

        let weak = Arc::downgrade(shared);
        shared.context.events.post_delayed(duration, move || {
            if let Some(shared) = weak.upgrade() {
                if shared.scan_generation.load(Ordering::SeqCst) == generation {
                    shared.stop_scan();
                }
            }
        });
        Ok(())
    }

    pub fn stop_scan(&self) {
        self.shared.stop_scan();
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.shared.ports.contains(address)
    }

    pub fn len(&self) -> usize {
        self.shared.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ports.is_empty()
    }

    /// Addresses of every open peer port
    pub fn addresses(&self) -> Vec<String> {
        self.shared.ports.keys()
    }

    /// Close and forget the port for `address`; a later scan may find it again
    pub fn remove(&self, address: &str) -> bool {
        self.shared.ports.remove(address).is_some()
    }
}

impl Port for BleServerPort {
    fn name(&self) -> &str {
        self.shared.ports.name()
    }

    fn state(&self) -> PortState {
        self.shared.ports.state()
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        self.shared.ports.write(data)
    }

    fn drain(&self) -> bool {
        self.shared.ports.drain()
    }

    fn close(&self) {
        self.shared.stop_scan();
        self.shared.ports.close();
    }

    fn set_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        self.shared.ports.set_listener(listener);
    }
}

impl Drop for BleServerPort {
    fn drop(&mut self) {
        self.close();
    }
}
