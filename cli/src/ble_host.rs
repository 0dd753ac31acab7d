// btleplug-backed BLE adapter
//
// Implements the core's `BleAdapter` and `GattConnection` on top of the
// platform Bluetooth stack. btleplug is async; every request is spawned on the
// CLI's tokio runtime and its completion is reported through the core's event
// handler. Only `connect` blocks, and it is always called from a port's own
// connect thread.

use bleport_core::transport::{
    Attribute, BleAdapter, DiscoveredDevice, GattConnection, GattEvent, GattEventHandler,
    GattStatus, LinkState, ScanHandler, TransportError,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct BtleplugAdapter {
    runtime: Handle,
    adapter: Adapter,
    /// Peripherals seen by the scan, keyed by address
    known: Arc<Mutex<HashMap<String, PeripheralId>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugAdapter {
    /// Open the local Bluetooth adapter at `index`
    pub async fn open(runtime: Handle, index: usize) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let count = adapters.len();
        let adapter = adapters.into_iter().nth(index).ok_or_else(|| {
            anyhow::anyhow!("No Bluetooth adapter at index {} ({} found)", index, count)
        })?;

        match adapter.adapter_info().await {
            Ok(description) => info!("Using Bluetooth adapter {}", description),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            runtime,
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        let known = self.known.lock().get(address).cloned();
        if let Some(id) = known {
            return self
                .adapter
                .peripheral(&id)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()));
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| p.address().to_string() == address)
            .ok_or_else(|| TransportError::ConnectionFailed(format!("{} not found", address)))
    }
}

async fn report_device(adapter: &Adapter, id: &PeripheralId) -> Option<DiscoveredDevice> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let mut device = DiscoveredDevice::new(peripheral.address().to_string());
    if let Ok(Some(properties)) = peripheral.properties().await {
        device.name = properties.local_name;
        device.rssi = properties.rssi;
    }
    Some(device)
}

impl BleAdapter for BtleplugAdapter {
    fn start_scan(&self, handler: ScanHandler, duration_hint: Duration) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let known = self.known.clone();

        let task = self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("BLE event stream unavailable: {}", e);
                    return;
                }
            };
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("BLE scan failed: {}", e);
                return;
            }
            debug!("Scanning, expected to run for {:?}", duration_hint);

            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDiscovered(id) = event {
                    if let Some(device) = report_device(&adapter, &id).await {
                        known.lock().insert(device.address.clone(), id);
                        handler(device);
                    }
                }
            }
        });

        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Stopping scan: {}", e);
            }
        });
    }

    fn connect(
        &self,
        address: &str,
        handler: GattEventHandler,
    ) -> Result<Box<dyn GattConnection>, TransportError> {
        let peripheral = self.runtime.block_on(async {
            let peripheral = self.find_peripheral(address).await?;
            peripheral
                .connect()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            Ok::<_, TransportError>(peripheral)
        })?;

        let connection = BtleplugConnection::new(
            self.runtime.clone(),
            self.adapter.clone(),
            peripheral,
            handler.clone(),
        );
        handler(GattEvent::ConnectionStateChanged(LinkState::Connected));
        Ok(Box::new(connection))
    }
}

/// Filters adapter link events for one peripheral.
///
/// `connect` reports the first link up itself, so a connected event is only
/// passed on once the link has been lost. Repeated events are dropped.
#[derive(Debug, Default)]
struct LinkTracker {
    link_lost: bool,
}

impl LinkTracker {
    fn observe(&mut self, state: LinkState) -> Option<LinkState> {
        match state {
            LinkState::Disconnected if !self.link_lost => {
                self.link_lost = true;
                Some(state)
            }
            LinkState::Connected if self.link_lost => {
                self.link_lost = false;
                Some(state)
            }
            _ => None,
        }
    }
}

struct BtleplugConnection {
    runtime: Handle,
    peripheral: Peripheral,
    handler: GattEventHandler,
    /// Discovered characteristics; an attribute handle is an index here
    characteristics: Arc<Mutex<Vec<Characteristic>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugConnection {
    fn new(runtime: Handle, adapter: Adapter, peripheral: Peripheral, handler: GattEventHandler) -> Self {
        let characteristics = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();

        // Link loss
        {
            let id = peripheral.id();
            let handler = handler.clone();
            tasks.push(runtime.spawn(async move {
                let Ok(mut events) = adapter.events().await else {
                    return;
                };
                let mut tracker = LinkTracker::default();
                while let Some(event) = events.next().await {
                    let change = match event {
                        CentralEvent::DeviceDisconnected(lost) if lost == id => {
                            tracker.observe(LinkState::Disconnected)
                        }
                        CentralEvent::DeviceConnected(found) if found == id => {
                            tracker.observe(LinkState::Connected)
                        }
                        _ => None,
                    };
                    if let Some(state) = change {
                        handler(GattEvent::ConnectionStateChanged(state));
                    }
                }
            }));
        }

        // Notifications
        {
            let peripheral = peripheral.clone();
            let handler = handler.clone();
            let characteristics = characteristics.clone();
            tasks.push(runtime.spawn(async move {
                let Ok(mut notifications) = peripheral.notifications().await else {
                    return;
                };
                while let Some(notification) = notifications.next().await {
                    let handle = characteristics
                        .lock()
                        .iter()
                        .position(|c: &Characteristic| c.uuid == notification.uuid);
                    if let Some(handle) = handle {
                        handler(GattEvent::AttributeChanged {
                            attribute: Attribute::new(notification.uuid, handle as u64),
                            value: notification.value,
                        });
                    }
                }
            }));
        }

        Self {
            runtime,
            peripheral,
            handler,
            characteristics,
            tasks: Mutex::new(tasks),
        }
    }

    fn characteristic(&self, attribute: &Attribute) -> Result<Characteristic, TransportError> {
        self.characteristics
            .lock()
            .get(attribute.handle as usize)
            .filter(|c| c.uuid == attribute.uuid)
            .cloned()
            .ok_or_else(|| TransportError::AttributeReadFailed(format!("unknown attribute {}", attribute)))
    }
}

impl GattConnection for BtleplugConnection {
    fn discover_services(&self) -> Result<(), TransportError> {
        let peripheral = self.peripheral.clone();
        let handler = self.handler.clone();
        let characteristics = self.characteristics.clone();

        self.runtime.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let found: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();
                    let attributes = found
                        .iter()
                        .enumerate()
                        .map(|(i, c)| Attribute::new(c.uuid, i as u64))
                        .collect();
                    *characteristics.lock() = found;
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::Success,
                        attributes,
                    }
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::Failure,
                        attributes: Vec::new(),
                    }
                }
            };
            handler(event);
        });
        Ok(())
    }

    fn read_attribute(&self, attribute: &Attribute) -> Result<(), TransportError> {
        let characteristic = self.characteristic(attribute)?;
        let peripheral = self.peripheral.clone();
        let handler = self.handler.clone();
        let attribute = *attribute;

        self.runtime.spawn(async move {
            let (status, value) = match peripheral.read(&characteristic).await {
                Ok(value) => (GattStatus::Success, value),
                Err(e) => {
                    debug!("Read of {} failed: {}", attribute, e);
                    (GattStatus::Failure, Vec::new())
                }
            };
            handler(GattEvent::AttributeRead {
                attribute,
                status,
                value,
            });
        });
        Ok(())
    }

    fn set_notification(&self, attribute: &Attribute, enable: bool) -> Result<(), TransportError> {
        let characteristic = self.characteristic(attribute)?;
        let peripheral = self.peripheral.clone();

        self.runtime.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            if let Err(e) = result {
                warn!("Changing notifications for {} failed: {}", characteristic.uuid, e);
            }
        });
        Ok(())
    }

    fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_late_connected_event_is_dropped() {
        let mut tracker = LinkTracker::default();
        assert_eq!(tracker.observe(LinkState::Connected), None);
        assert_eq!(tracker.observe(LinkState::Connected), None);
    }

    #[test]
    fn test_reconnect_after_link_loss_is_forwarded() {
        let mut tracker = LinkTracker::default();
        assert_eq!(tracker.observe(LinkState::Disconnected), Some(LinkState::Disconnected));
        assert_eq!(tracker.observe(LinkState::Disconnected), None);
        assert_eq!(tracker.observe(LinkState::Connected), Some(LinkState::Connected));
        assert_eq!(tracker.observe(LinkState::Connected), None);
    }
}
