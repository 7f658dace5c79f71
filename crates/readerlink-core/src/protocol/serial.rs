//! Serial port handling
//!
//! Port discovery and the [`Transport`] implementation backed by the
//! `serialport` crate.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use super::{ProtocolError, Transport, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM5")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key so that ttyACM* ports come first (numeric suffix order), then
/// ttyUSB*, then everything else by name. Readers enumerate as ACM devices.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("COM") {
        if let Ok(num) = rest.parse::<usize>() {
            return (2, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List candidate serial ports in the order they should be tried
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux: CDC devices sometimes are missing from the enumeration API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port at 8N1 with immediate-return reads
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    serialport::new(name, baud)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::ZERO)
        .open()
        .map_err(|e| ProtocolError::Connect(format!("{}: {}", name, e)))
}

/// How long a write may keep retrying while the TX queue is full
const WRITE_RETRY_WINDOW: Duration = Duration::from_millis(500);

/// Write all of `data`, retrying short waits for a full TX queue.
///
/// The port is opened with a zero timeout so reads return at once; the same
/// timeout makes a write fail with `TimedOut` when the driver queue is full.
fn write_patiently<W: Write + ?Sized>(
    port: &mut W,
    mut data: &[u8],
    window: Duration,
) -> io::Result<()> {
    let started = Instant::now();
    while !data.is_empty() {
        match port.write(data) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "serial port accepted no bytes",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
                    && started.elapsed() < window =>
            {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Assert DTR so CDC readers start talking. Not all adapters support it.
fn configure_port(port: &mut dyn SerialPort) {
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("failed to set DTR on {:?}: {} (continuing)", port.name(), e);
    }
}

/// [`Transport`] over a local serial device
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open `address` at 115200 baud, 8 data bits, 1 stop bit, no parity
    pub fn open(address: &str) -> Result<Self, ProtocolError> {
        let mut port = open_port(address, None)?;
        configure_port(port.as_mut());
        tracing::debug!("opened serial port {}", address);
        Ok(Self {
            name: address.to_string(),
            port: Some(port),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        write_patiently(port.as_mut(), data, WRITE_RETRY_WINDOW)?;
        port.flush()
    }

    fn set_write_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        // serialport applies one timeout to both directions; changing it
        // would make reads block. Writes keep the zero timeout too, which
        // `write_patiently` absorbs while the TX queue drains.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "serial backend shares one timeout between reads and writes",
        ))
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            tracing::debug!("closed serial port {}", self.name);
        }
        Ok(())
    }
}
