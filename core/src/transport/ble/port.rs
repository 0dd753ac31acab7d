//! BLE peer port
//!
//! A `BlePort` drives one peer connection on top of a `MemoryPort`. A worker
//! thread asks the adapter to connect; every callback the adapter delivers is
//! re-posted onto the shared event loop, where the connection state machine
//! runs:
//!
//! ```text
//! Connecting -> ServicesDiscovering -> InfoExchanging -> Ready
//!      any state -> Disconnected (link loss)      any state -> Closed
//! ```
//!
//! Progress is reported to the driver as framed status sentences
//! (`BLECONNECT`, `BLEDISCOVER`, `BLEINFO`) on the port's input stream.

use super::gatt::{DeviceInfo, IdentityField, PeerDevice, IDENTITY_SEQUENCE};
use super::sentence::{self, DriverCommand, LineReader, StatusSentence};
use crate::config::Config;
use crate::events::EventHandle;
use crate::port::{InputListener, MemoryPort, Port, PortError, PortState};
use crate::transport::abstraction::{
    Attribute, BleAdapter, BleContext, GattConnection, GattEvent, GattEventHandler, GattStatus,
    LinkState, TransportError,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Connection state machine of a peer port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ServicesDiscovering,
    InfoExchanging,
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct PendingRead {
    field: IdentityField,
    attribute: Attribute,
    id: u64,
}

/// Peer state owned by the event loop
struct Session {
    state: ConnectionState,
    device: PeerDevice,
    link_up: bool,
    discovery_started: bool,
    reads: VecDeque<IdentityField>,
    pending: Option<PendingRead>,
    next_read_id: u64,
}

struct BleShared {
    address: String,
    memory: MemoryPort,
    events: EventHandle,
    config: Config,
    connection: Mutex<Option<Arc<dyn GattConnection>>>,
    session: Mutex<Session>,
    /// Link-level connected flag, readable from any thread
    connected: AtomicBool,
    closed: AtomicBool,
    commands: Mutex<LineReader>,
}

impl BleShared {
    fn connection(&self) -> Option<Arc<dyn GattConnection>> {
        self.connection.lock().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut session = self.session.lock();
        if session.state != ConnectionState::Closed {
            session.state = state;
        }
    }

    fn send_line(&self, line: &str) {
        match self.memory.send(line.as_bytes()) {
            Ok(n) if n < line.len() => {
                warn!("{}: driver not reading, status line truncated", self.address)
            }
            Ok(_) => trace!("{}: sent {}", self.address, line.trim_end()),
            Err(_) => debug!("{}: port closed, status line dropped", self.address),
        }
    }

    /// Callback handed to the adapter; forwards every event onto the loop
    fn event_handler(self: &Arc<Self>) -> GattEventHandler {
        let weak = Arc::downgrade(self);
        let events = self.events.clone();
        Arc::new(move |event: GattEvent| {
            let weak = weak.clone();
            let posted = events.post(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_event(event);
                }
            });
            if !posted {
                trace!("Event loop stopped, dropping GATT event");
            }
        })
    }

    // ------------------------------------------------------------------------
    // Connect worker
    // ------------------------------------------------------------------------

    fn run_connect(self: &Arc<Self>, adapter: &dyn BleAdapter) {
        match adapter.connect(&self.address, self.event_handler()) {
            Ok(connection) => {
                let connection: Arc<dyn GattConnection> = Arc::from(connection);
                let shared = self.clone();
                let attached = connection.clone();
                if !self.events.post(move || shared.attach(attached)) {
                    connection.close();
                }
            }
            Err(e) => {
                warn!("{}: failed to connect to BLE device: {}", self.address, e);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn attach(self: &Arc<Self>, connection: Arc<dyn GattConnection>) {
        {
            let mut slot = self.connection.lock();
            if self.closed.load(Ordering::SeqCst) {
                drop(slot);
                debug!("{}: port closed before connect returned", self.address);
                connection.close();
                return;
            }
            *slot = Some(connection);
        }

        let discover_now = {
            let session = self.session.lock();
            session.link_up && !session.discovery_started
        };
        if discover_now {
            self.start_discovery();
        }
    }

    // ------------------------------------------------------------------------
    // Event handling (event loop only)
    // ------------------------------------------------------------------------

    fn handle_event(self: &Arc<Self>, event: GattEvent) {
        if self.closed.load(Ordering::SeqCst) {
            trace!("{}: closed, ignoring {:?}", self.address, event);
            return;
        }

        match event {
            GattEvent::ConnectionStateChanged(LinkState::Connected) => self.on_connected(),
            GattEvent::ConnectionStateChanged(LinkState::Disconnected) => self.on_disconnected(),
            GattEvent::ConnectionStateChanged(state) => {
                debug!("{}: link state {:?}", self.address, state)
            }
            GattEvent::ServicesDiscovered { status, attributes } => {
                self.on_services_discovered(status, attributes)
            }
            GattEvent::AttributeRead {
                attribute,
                status,
                value,
            } => self.on_attribute_read(attribute, status, &value),
            GattEvent::AttributeChanged { attribute, value } => {
                trace!("{}: {} changed ({} bytes)", self.address, attribute, value.len());
                if self.connected.load(Ordering::SeqCst) {
                    self.send_bytes(&value);
                }
            }
        }
    }

    fn send_bytes(&self, data: &[u8]) {
        match self.memory.send(data) {
            Ok(n) if n < data.len() => warn!(
                "{}: driver not reading, dropped {} bytes",
                self.address,
                data.len() - n
            ),
            Ok(_) => {}
            Err(_) => debug!("{}: port closed, notification dropped", self.address),
        }
    }

    fn on_connected(self: &Arc<Self>) {
        info!("{}: BLE device connected", self.address);
        self.send_line(&StatusSentence::Connect { address: &self.address }.to_line());
        self.connected.store(true, Ordering::SeqCst);

        {
            let mut session = self.session.lock();
            session.link_up = true;
            session.discovery_started = false;
            session.reads.clear();
            session.pending = None;
            if session.state != ConnectionState::Closed {
                session.state = ConnectionState::ServicesDiscovering;
            }
        }

        if self.connection().is_some() {
            self.start_discovery();
        } else {
            debug!("{}: connection not attached yet, discovery deferred", self.address);
        }
    }

    fn on_disconnected(&self) {
        info!("{}: BLE device disconnected", self.address);
        self.connected.store(false, Ordering::SeqCst);

        let mut session = self.session.lock();
        session.link_up = false;
        session.discovery_started = false;
        session.reads.clear();
        session.pending = None;
        if session.state != ConnectionState::Closed {
            session.state = ConnectionState::Disconnected;
        }
    }

    fn start_discovery(self: &Arc<Self>) {
        let Some(connection) = self.connection() else {
            return;
        };
        {
            let mut session = self.session.lock();
            session.discovery_started = true;
        }
        if let Err(e) = connection.discover_services() {
            self.discovery_failed(&e.to_string());
        }
    }

    fn discovery_failed(&self, reason: &str) {
        error!("{}: failure in discovering BLE services: {}", self.address, reason);
        self.connected.store(false, Ordering::SeqCst);

        let mut session = self.session.lock();
        session.link_up = false;
        session.reads.clear();
        session.pending = None;
        if session.state != ConnectionState::Closed {
            session.state = ConnectionState::Disconnected;
        }
    }

    fn on_services_discovered(self: &Arc<Self>, status: GattStatus, attributes: Vec<Attribute>) {
        if !status.is_success() {
            self.discovery_failed("platform reported failure");
            return;
        }

        let lines: Vec<String> = {
            let mut session = self.session.lock();
            if !session.link_up {
                debug!("{}: services discovered after link loss, ignoring", self.address);
                return;
            }
            session.device.set_attributes(attributes);
            session.device.info = DeviceInfo::default();
            session.reads = IDENTITY_SEQUENCE.iter().copied().collect();
            session.pending = None;
            session.state = ConnectionState::InfoExchanging;

            session
                .device
                .attributes
                .iter()
                .map(|attribute| {
                    StatusSentence::Discover {
                        address: &self.address,
                        uuid: attribute.uuid,
                    }
                    .to_line()
                })
                .collect()
        };

        info!("{}: discovered {} attributes", self.address, lines.len());
        for line in &lines {
            self.send_line(line);
        }
        self.advance_reads();
    }

    /// Issue the next identity read, skipping fields the peer does not offer.
    /// Emits `BLEINFO` once the sequence is exhausted.
    fn advance_reads(self: &Arc<Self>) {
        let connection = self.connection();
        let mut session = self.session.lock();
        if session.pending.is_some() || !session.link_up {
            return;
        }

        loop {
            let Some(field) = session.reads.pop_front() else {
                session.state = ConnectionState::Ready;
                let line = StatusSentence::Info {
                    info: &session.device.info,
                }
                .to_line();
                drop(session);

                info!("{}: device info exchanged", self.address);
                self.send_line(&line);
                return;
            };

            let Some(attribute) = session.device.find(&field.uuid()) else {
                debug!("{}: {:?} not offered, skipping", self.address, field);
                continue;
            };
            let Some(gatt) = connection.as_ref() else {
                debug!("{}: no connection, skipping {:?}", self.address, field);
                continue;
            };

            match gatt.read_attribute(&attribute) {
                Ok(()) => {
                    session.next_read_id += 1;
                    let id = session.next_read_id;
                    session.pending = Some(PendingRead {
                        field,
                        attribute,
                        id,
                    });
                    drop(session);
                    self.schedule_read_timeout(id);
                    return;
                }
                Err(e) => {
                    debug!("{}: read of {:?} not issued: {}", self.address, field, e);
                }
            }
        }
    }

    fn schedule_read_timeout(self: &Arc<Self>, id: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.events
            .post_delayed(self.config.ble.attribute_read_timeout(), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_read_timeout(id);
                }
            });
    }

    fn on_read_timeout(self: &Arc<Self>, id: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut session = self.session.lock();
            match &session.pending {
                Some(pending) if pending.id == id => {
                    warn!("{}: read of {:?} timed out, skipping", self.address, pending.field);
                    session.pending = None;
                }
                _ => return,
            }
        }
        self.advance_reads();
    }

    fn on_attribute_read(self: &Arc<Self>, attribute: Attribute, status: GattStatus, value: &[u8]) {
        {
            let mut session = self.session.lock();
            let field = match &session.pending {
                Some(pending) if pending.attribute == attribute => pending.field,
                _ => {
                    debug!("{}: unsolicited read result for {}", self.address, attribute);
                    return;
                }
            };
            session.pending = None;

            if status.is_success() {
                session.device.info.apply(field, value);
                debug!("{}: read {:?} ({} bytes)", self.address, field, value.len());
            } else {
                debug!("{}: read of {:?} failed, keeping default", self.address, field);
            }
        }
        self.advance_reads();
    }

    // ------------------------------------------------------------------------
    // Driver commands
    // ------------------------------------------------------------------------

    fn on_driver_bytes(self: &Arc<Self>, data: &[u8]) {
        trace!("{}: driver wrote {}", self.address, hex::encode(data));
        let lines = self.commands.lock().push(data);

        for line in lines {
            let Some(payload) = sentence::verify(&line) else {
                debug!("{}: ignoring unframed driver line {:?}", self.address, line);
                continue;
            };
            match DriverCommand::parse(payload) {
                Some(command) => {
                    let shared = self.clone();
                    self.events.post(move || shared.apply_command(command));
                }
                None => debug!("{}: unhandled driver sentence {}", self.address, payload),
            }
        }
    }

    fn apply_command(&self, command: DriverCommand) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let attributes = self.session.lock().device.find_all(&command.uuid());
        if attributes.is_empty() {
            debug!("{}: {:?} names no discovered attribute", self.address, command);
            return;
        }
        let Some(connection) = self.connection() else {
            return;
        };

        let enable = matches!(command, DriverCommand::StartNotify(_));
        for attribute in attributes {
            match connection.set_notification(&attribute, enable) {
                Ok(()) => info!(
                    "{}: notifications {} for {}",
                    self.address,
                    if enable { "enabled" } else { "disabled" },
                    attribute
                ),
                Err(e) => warn!("{}: could not change notifications for {}: {}", self.address, attribute, e),
            }
        }
    }
}

/// Transport-side listener: bytes the driver wrote to the port
struct DriverInput(Weak<BleShared>);

impl InputListener for DriverInput {
    fn data_received(&self, data: &[u8]) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_driver_bytes(data);
        }
    }
}

struct ConnectWorker {
    thread: JoinHandle<()>,
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl ConnectWorker {
    /// Wait at most `timeout` for the worker; detach it if it never returns
    fn join(self, address: &str, timeout: Duration) {
        let finished = {
            let (lock, cvar) = &*self.done;
            let deadline = Instant::now() + timeout;
            let mut finished = lock.lock();
            while !*finished {
                if cvar.wait_until(&mut finished, deadline).timed_out() {
                    break;
                }
            }
            *finished
        };

        if !finished {
            warn!(
                "{}: connect worker still blocked after {:?}, detaching",
                address, timeout
            );
            return;
        }
        if self.thread.thread().id() != std::thread::current().id() {
            let _ = self.thread.join();
        }
    }
}

/// Port to a single BLE peer
pub struct BlePort {
    shared: Arc<BleShared>,
    connector: Mutex<Option<ConnectWorker>>,
}

impl BlePort {
    /// Create the port and start connecting to `address`
    pub fn new(address: &str, context: &BleContext) -> Result<Self, TransportError> {
        Self::start(address, context, None)
    }

    /// Like `new`, with the driver listener installed before the first
    /// status sentence can be produced
    pub fn with_listener(
        address: &str,
        context: &BleContext,
        listener: Arc<dyn InputListener>,
    ) -> Result<Self, TransportError> {
        Self::start(address, context, Some(listener))
    }

    fn start(
        address: &str,
        context: &BleContext,
        listener: Option<Arc<dyn InputListener>>,
    ) -> Result<Self, TransportError> {
        let memory = MemoryPort::new(address, &context.config.port)?;
        if listener.is_some() {
            memory.set_listener(listener);
        }
        let shared = Arc::new(BleShared {
            address: address.to_string(),
            memory,
            events: context.events.clone(),
            config: context.config.clone(),
            connection: Mutex::new(None),
            session: Mutex::new(Session {
                state: ConnectionState::Connecting,
                device: PeerDevice::new(address),
                link_up: false,
                discovery_started: false,
                reads: VecDeque::new(),
                pending: None,
                next_read_id: 0,
            }),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            commands: Mutex::new(LineReader::new()),
        });
        shared
            .memory
            .set_transport_listener(Some(Arc::new(DriverInput(Arc::downgrade(&shared)))));

        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let spawned = {
            let shared = shared.clone();
            let adapter = context.adapter.clone();
            let done = done.clone();
            std::thread::Builder::new()
                .name(format!("ble-{}", address))
                .spawn(move || {
                    shared.run_connect(adapter.as_ref());
                    let (lock, cvar) = &*done;
                    *lock.lock() = true;
                    cvar.notify_all();
                })
        };

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                shared.memory.close();
                return Err(PortError::WorkerSpawn(e.to_string()).into());
            }
        };

        debug!("{}: BLE port created", address);
        Ok(Self {
            shared,
            connector: Mutex::new(Some(ConnectWorker { thread, done })),
        })
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.session.lock().state
    }

    /// Whether the link-level connection is up
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of the peer record
    pub fn device(&self) -> PeerDevice {
        self.shared.session.lock().device.clone()
    }

    /// Push bytes toward the driver as if they came from the peer
    pub fn send(&self, data: &[u8]) -> Result<usize, PortError> {
        self.shared.memory.send(data)
    }

    pub fn set_write_timeout(&self, timeout: Duration) {
        self.shared.memory.set_write_timeout(timeout);
    }
}

impl Port for BlePort {
    fn name(&self) -> &str {
        &self.shared.address
    }

    fn state(&self) -> PortState {
        if self.shared.closed.load(Ordering::SeqCst) {
            PortState::Failed
        } else if !self.shared.connected.load(Ordering::SeqCst) {
            PortState::Limbo
        } else {
            self.shared.memory.state()
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        self.shared.memory.write(data)
    }

    fn drain(&self) -> bool {
        self.shared.memory.drain()
    }

    fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connector = self.connector.lock().take();
        if let Some(worker) = connector {
            worker.join(&shared.address, shared.config.ble.connect_join_timeout());
        }

        let connection = shared.connection.lock().take();
        if let Some(connection) = connection {
            connection.close();
            debug!("{}: connection released", shared.address);
        }

        {
            let mut session = shared.session.lock();
            session.state = ConnectionState::Closed;
            session.link_up = false;
            session.reads.clear();
            session.pending = None;
        }
        shared.connected.store(false, Ordering::SeqCst);
        shared.memory.close();
        info!("{}: BLE port closed", shared.address);
    }

    fn set_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        self.shared.memory.set_listener(listener);
    }
}

impl Drop for BlePort {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLoop;
    use crate::transport::abstraction::ScanHandler;

    /// Adapter whose connect attempts always fail
    struct RefusingAdapter;

    impl BleAdapter for RefusingAdapter {
        fn start_scan(&self, _: ScanHandler, _: Duration) -> Result<(), TransportError> {
            Ok(())
        }

        fn stop_scan(&self) {}

        fn connect(
            &self,
            address: &str,
            _: GattEventHandler,
        ) -> Result<Box<dyn GattConnection>, TransportError> {
            Err(TransportError::ConnectionFailed(address.to_string()))
        }
    }

    fn wait_for_state(port: &BlePort, state: ConnectionState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if port.connection_state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::InfoExchanging.to_string(), "InfoExchanging");
    }

    #[test]
    fn test_failed_connect_stays_disconnected() {
        let event_loop = EventLoop::start("test-refuse").expect("Event loop");
        let context = BleContext::new(
            Arc::new(RefusingAdapter),
            event_loop.handle(),
            Config::default(),
        );

        let port = BlePort::new("AA:BB:CC:DD:EE:FF", &context).expect("Port");
        assert!(wait_for_state(&port, ConnectionState::Disconnected));
        assert_eq!(port.state(), PortState::Limbo);
        assert!(!port.is_connected());

        port.close();
        assert_eq!(port.connection_state(), ConnectionState::Closed);
        assert_eq!(port.state(), PortState::Failed);
        assert_eq!(port.write(b"x"), Err(PortError::Closed));
    }
}
