//! Concrete transports

pub mod memory;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

pub use memory::{MemoryRobot, MemoryTransport};
#[cfg(feature = "serial")]
pub use serial::{SerialPortKind, SerialTransport, detect_robot_ports};
pub use tcp::{DEFAULT_WIFI_PORT, LEGACY_SOCKET_PORT, LegacySocketTransport, WifiTransport};
