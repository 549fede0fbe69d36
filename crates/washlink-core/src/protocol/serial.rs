//! Serial port handling
//!
//! Port discovery and translation of line settings into an open async stream.

use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::{TransportError, DEFAULT_BAUD_RATE};

/// USB-serial adapters show up under these device name prefixes, in order of preference
const ADAPTER_PREFIXES: [&str; 2] = ["ttyACM", "ttyUSB"];

/// A port a controller may be cabled to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    /// Device path or COM name
    pub name: String,
    /// Set when the port belongs to a USB adapter the OS identified
    pub adapter: Option<UsbAdapter>,
}

/// Identity of a USB-serial adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbAdapter {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Manufacturer string
    pub manufacturer: Option<String>,
    /// Product string
    pub product: Option<String>,
}

impl PortInfo {
    fn unidentified(name: String) -> Self {
        Self { name, adapter: None }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let adapter = match info.port_type {
            SerialPortType::UsbPort(usb) => Some(UsbAdapter {
                vendor_id: usb.vid,
                product_id: usb.pid,
                manufacturer: usb.manufacturer,
                product: usb.product,
            }),
            _ => None,
        };
        Self {
            name: info.port_name,
            adapter,
        }
    }
}

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    /// 7 data bits, the ASCII framing default
    #[serde(rename = "7")]
    Seven,
    /// 8 data bits
    #[serde(rename = "8")]
    Eight,
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit
    #[serde(rename = "1")]
    One,
    /// Two stop bits
    #[serde(rename = "2")]
    Two,
}

/// Line settings for one controller revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialSettings {
    /// Line speed in bits per second
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: DataBits,
    /// Parity mode
    pub parity: Parity,
    /// Stop bits per character
    pub stop_bits: StopBits,
}

impl Default for SerialSettings {
    /// 9600 7E1, the framing every observed controller uses
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            stop_bits: StopBits::One,
        }
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Adapters first, in prefix order and then by number; everything else by name
fn adapter_rank(name: &str) -> (usize, usize, &str) {
    let base = name.rsplit('/').next().unwrap_or(name);
    ADAPTER_PREFIXES
        .iter()
        .enumerate()
        .find_map(|(family, prefix)| {
            let number = base.strip_prefix(prefix)?.parse().unwrap_or(usize::MAX);
            Some((family, number, base))
        })
        .unwrap_or((ADAPTER_PREFIXES.len(), 0, base))
}

/// Adapter device nodes present in /dev, listed or not
#[cfg(target_os = "linux")]
fn adapter_nodes() -> impl Iterator<Item = PortInfo> {
    fs::read_dir("/dev")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| ADAPTER_PREFIXES.iter().any(|prefix| name.starts_with(prefix)))
        .map(|name| PortInfo::unidentified(format!("/dev/{}", name)))
}

/// Every serial port on this host, adapters first
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    #[cfg(target_os = "linux")]
    ports.extend(adapter_nodes());

    // Stable sort keeps the identified entry ahead of its bare /dev twin
    ports.sort_by(|a, b| (adapter_rank(&a.name), &a.name).cmp(&(adapter_rank(&b.name), &b.name)));
    ports.dedup_by(|later, earlier| later.name == earlier.name);
    debug!("Found {} serial ports", ports.len());
    ports
}

/// Resolve the configured port name, picking the first listed port when empty
pub fn resolve_port(configured: &str) -> Result<String, TransportError> {
    if !configured.trim().is_empty() {
        return Ok(configured.to_string());
    }
    let port = list_ports()
        .into_iter()
        .next()
        .ok_or(TransportError::NoPortAvailable)?;
    info!("No port configured, using {}", port.name);
    Ok(port.name)
}

/// Open an async serial stream with the given line settings
pub fn open_stream(name: &str, settings: &SerialSettings) -> Result<SerialStream, TransportError> {
    debug!(
        "Opening {} at {} baud ({:?}/{:?}/{:?})",
        name, settings.baud_rate, settings.data_bits, settings.parity, settings.stop_bits
    );
    let stream = tokio_serial::new(name, settings.baud_rate)
        .data_bits(settings.data_bits.into())
        .parity(settings.parity.into())
        .stop_bits(settings.stop_bits.into())
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open_native_async()?;
    Ok(stream)
}
