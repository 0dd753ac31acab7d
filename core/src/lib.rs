// BLE Port Core: byte-stream ports over GATT peers
//
// A protocol driver sees a `Port`: bytes in, bytes out, a state. Behind it
// sit in-memory pipes, worker threads and, for BLE, one connection state
// machine per peer fed by a platform `BleAdapter`.

pub mod config;
pub mod events;
pub mod port;
pub mod transport;

pub use config::{BleConfig, Config, ConfigError, PortConfig};
pub use events::{EventHandle, EventLoop};
pub use port::{
    BytePipe, InputListener, MemoryPort, MultiPort, PipeError, Port, PortError, PortState,
};
pub use transport::{
    BleAdapter, BleContext, BlePort, BleServerPort, ConnectionState, GattConnection, GattEvent,
    TransportError,
};
