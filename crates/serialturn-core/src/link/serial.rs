//! Serial port link
//!
//! [`SerialLink`] drives a real device through the `serialport` crate.
//! Also provides port discovery and device name resolution.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{Read, Write};

use super::Link;
use crate::config::LinkConfig;
use crate::{Result, TransportError};

/// A serial port found during discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PortInfo {
    /// Device path or COM name
    pub name: String,
    /// USB vendor ID
    pub vid: Option<u16>,
    /// USB product ID
    pub pid: Option<u16>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
    /// USB serial number string
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = PortInfo::bare(info.port_name);
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        port
    }
}

/// Orders CDC-ACM devices first, then USB-serial adapters, each by number.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let base = display_name(name);
    let rank = [("ttyACM", 0u8), ("ttyUSB", 1u8)]
        .iter()
        .find_map(|(prefix, rank)| {
            base.strip_prefix(prefix)
                .map(|n| (*rank, n.parse::<usize>().unwrap_or(usize::MAX)))
        });
    match rank {
        Some((rank, number)) => (rank, number, base.to_string()),
        None => (2, 0, base.to_string()),
    }
}

/// Enumerate serial ports in a stable order.
///
/// On Linux, `ttyACM*`/`ttyUSB*` nodes the driver enumeration missed are
/// added from `/dev`.
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: HashMap<String, PortInfo> = match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(PortInfo::from)
            .map(|port| (port.name.clone(), port))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "serial port enumeration failed");
            HashMap::new()
        }
    };

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        let nodes = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|node| node.starts_with("ttyACM") || node.starts_with("ttyUSB"));
        for node in nodes {
            let path = format!("/dev/{node}");
            found.entry(path.clone()).or_insert_with(|| PortInfo::bare(path));
        }
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    ports.sort_by_cached_key(|port| port_sort_key(&port.name));
    tracing::debug!(count = ports.len(), "serial ports listed");
    ports
}

/// Resolve a device identifier to a path the driver can open.
///
/// On Unix a bare kernel name such as `ttyUSB0` becomes `/dev/ttyUSB0`.
pub fn resolve_device(device: &str) -> String {
    if cfg!(unix) && !device.is_empty() && !device.contains('/') {
        format!("/dev/{}", device)
    } else {
        device.to_string()
    }
}

/// Last path component of a device path
pub fn display_name(device: &str) -> &str {
    device.rsplit(['/', '\\']).next().unwrap_or(device)
}

enum PortState {
    Unopened,
    Open(Box<dyn SerialPort>),
    Closed,
}

/// Link backed by a serial port
pub struct SerialLink {
    config: LinkConfig,
    path: String,
    name: String,
    port: PortState,
    rts: bool,
    dtr: bool,
}

impl SerialLink {
    /// Create a link for the configured device. The port is not opened yet.
    pub fn new(config: LinkConfig) -> Self {
        let path = resolve_device(&config.device);
        let name = display_name(&path).to_string();
        Self {
            config,
            path,
            name,
            port: PortState::Unopened,
            rts: false,
            dtr: false,
        }
    }

    /// Resolved device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        let flow_control = if self.config.driver_rtscts {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        };

        serialport::new(&self.path, self.config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(flow_control)
            .timeout(self.config.read_timeout())
            .open()
            .map_err(|e| TransportError::LinkUnavailable {
                device: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Port for I/O, opening it on first use
    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        if matches!(self.port, PortState::Unopened) {
            self.open()?;
        }
        match &mut self.port {
            PortState::Open(port) => Ok(port),
            _ => Err(TransportError::LinkClosed),
        }
    }
}

impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if matches!(self.port, PortState::Open(_)) {
            return Ok(());
        }

        let mut port = self.open_port()?;

        // Leave DTR low unless asked: toggling it resets many Arduino-style boards
        if self.config.dsrdtr {
            match port.write_data_terminal_ready(true) {
                Ok(()) => self.dtr = true,
                Err(e) => tracing::warn!(device = %self.name, error = %e, "failed to assert DTR"),
            }
        }

        // Opening raises RTS; the line is left alone until a flow gate claims it
        self.rts = true;

        port.clear(serialport::ClearBuffer::All)?;

        tracing::info!(
            device = %self.path,
            baud = self.config.baud_rate,
            driver_rtscts = self.config.driver_rtscts,
            dsrdtr = self.config.dsrdtr,
            "serial link opened"
        );
        self.port = PortState::Open(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        matches!(self.port, PortState::Open(_))
    }

    fn close(&mut self) -> Result<()> {
        if let PortState::Open(_) = std::mem::replace(&mut self.port, PortState::Closed) {
            tracing::info!(device = %self.path, "serial link closed");
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port()?
            .write_all(bytes)
            .map_err(TransportError::from_io)
    }

    fn flush(&mut self) -> Result<()> {
        self.port()?.flush().map_err(TransportError::from_io)
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let port = self.port()?;
        let waiting = port.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; waiting];
        let n = port.read(&mut buf).map_err(TransportError::from_io)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_exact(&mut self, size: usize) -> Result<Vec<u8>> {
        let port = self.port()?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(TransportError::from_io(e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.port()?.bytes_to_read()?)
    }

    fn bytes_to_write(&mut self) -> Result<u32> {
        Ok(self.port()?.bytes_to_write()?)
    }

    fn rts(&self) -> bool {
        self.rts
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port()?.write_request_to_send(level)?;
        self.rts = level;
        Ok(())
    }

    fn cts(&mut self) -> Result<bool> {
        Ok(self.port()?.read_clear_to_send()?)
    }

    fn dtr(&self) -> bool {
        self.dtr
    }

    fn dsr(&mut self) -> Result<bool> {
        Ok(self.port()?.read_data_set_ready()?)
    }
}
