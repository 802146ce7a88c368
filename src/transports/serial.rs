//! Serial transports: USB cable and expansion UART

use std::time::Duration;

use serialport::SerialPortType;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::codec::Dialect;
use crate::transport::{Link, Transport};
use crate::{LinkError, Result};

/// Silicon Labs vendor id used by the robot's CP210x USB bridge.
const CP210X_VID: u16 = 0x10C4;

/// Physical serial interface on the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPortKind {
    /// USB cable into the robot's bridge chip.
    Usb,
    /// Expansion header UART.
    Expansion,
}

impl SerialPortKind {
    pub fn default_baud(self) -> u32 {
        match self {
            SerialPortKind::Usb => 115_200,
            SerialPortKind::Expansion => 921_600,
        }
    }
}

/// Serial link speaking the binary dialect
#[derive(Debug, Clone)]
pub struct SerialTransport {
    /// `None` selects the first detected robot port at connect time.
    port: Option<String>,
    baud: u32,
    kind: SerialPortKind,
}

impl SerialTransport {
    pub fn new(kind: SerialPortKind, port: Option<String>) -> Self {
        Self { port: port.filter(|p| !p.is_empty()), baud: kind.default_baud(), kind }
    }

    pub fn usb(port: impl Into<String>) -> Self {
        Self::new(SerialPortKind::Usb, Some(port.into()))
    }

    pub fn expansion(port: impl Into<String>) -> Self {
        Self::new(SerialPortKind::Expansion, Some(port.into()))
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    pub fn kind(&self) -> SerialPortKind {
        self.kind
    }

    fn resolve_port(&self) -> Result<String> {
        if let Some(port) = &self.port {
            return Ok(port.clone());
        }
        let mut found = detect_robot_ports()?;
        if found.len() > 1 {
            warn!(ports = ?found, "Several robot serial ports detected, using the first");
        }
        if found.is_empty() {
            return Err(LinkError::connect_failed(
                "serial",
                "no serial port given and no robot detected",
            ));
        }
        Ok(found.swap_remove(0))
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    fn locator(&self) -> String {
        match &self.port {
            Some(port) => format!("{port}@{}", self.baud),
            None => format!("auto@{}", self.baud),
        }
    }

    fn dialect(&self) -> Dialect {
        Dialect::RosSerial
    }

    async fn connect(&self, _timeout: Duration) -> Result<Link> {
        let port = self.resolve_port()?;
        let stream = tokio_serial::new(&port, self.baud).open_native_async().map_err(|e| {
            LinkError::connect_failed_with_source(&port, "cannot open serial port", Box::new(e))
        })?;
        info!(port = %port, baud = self.baud, kind = ?self.kind, "Serial link opened");
        Ok(Link::from_stream(stream))
    }
}

/// List serial ports that look like a robot's USB bridge.
pub fn detect_robot_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(|e| {
        LinkError::connect_failed_with_source("serial", "cannot enumerate serial ports", Box::new(e))
    })?;

    Ok(ports
        .into_iter()
        .filter(|port| match &port.port_type {
            SerialPortType::UsbPort(info) => {
                let product = info.product.as_deref().unwrap_or_default();
                info.vid == CP210X_VID || product.contains("CP210") || product.contains("USB Serial")
            }
            _ => false,
        })
        .map(|port| port.port_name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bauds_per_interface() {
        assert_eq!(SerialTransport::usb("/dev/ttyUSB0").baud, 115_200);
        assert_eq!(SerialTransport::expansion("/dev/ttyAMA0").baud, 921_600);
        assert_eq!(SerialTransport::usb("COM3").with_baud(2_000_000).baud, 2_000_000);
    }

    #[test]
    fn empty_locator_means_auto_detect() {
        let transport = SerialTransport::new(SerialPortKind::Usb, Some(String::new()));
        assert_eq!(transport.locator(), "auto@115200");
        assert_eq!(transport.dialect(), Dialect::RosSerial);
    }

    #[tokio::test]
    async fn missing_port_fails_to_connect() {
        let transport = SerialTransport::usb("/dev/martylink-no-such-port");
        let err = transport.connect(Duration::from_millis(100)).await.err().unwrap();
        assert!(matches!(err, LinkError::Connect { .. }));
    }
}
