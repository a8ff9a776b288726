//! Serial port handling
//!
//! Opens node UARTs as async streams and wraps them in [`StreamLink`]s.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
use std::time::Duration;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;

use super::{LinkError, StreamLink};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key so that USB-UART bridges (ttyUSB*, where the ESP32 nodes enumerate)
/// come first in numeric order, then ttyACM*, then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyUSB"), (1u8, "ttyACM")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open a node UART as an async stream, 8N1 without flow control
pub fn open_port(name: &str, baud_rate: u32) -> Result<SerialStream, LinkError> {
    let mut port = tokio_serial::new(name, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| LinkError::Serial(format!("{name}: {e}")))?;

    // Keep DTR asserted; toggling it resets ESP32 dev boards into the bootloader
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!(port = name, "failed to set DTR high: {e} (continuing)");
    }

    Ok(port)
}

/// Open `name` and start a [`StreamLink`] on it
pub fn open_link(
    label: &str,
    name: &str,
    baud_rate: u32,
    write_timeout: Duration,
    cancel: CancellationToken,
) -> Result<StreamLink, LinkError> {
    let port = open_port(name, baud_rate)?;
    tracing::info!(link = label, port = name, baud_rate, "opened node link");
    Ok(StreamLink::spawn(label, port, write_timeout, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_bridges_sort_first() {
        let names = vec![
            "/dev/ttyACM0",
            "/dev/ttyUSB10",
            "/dev/ttyUSB2",
            "/dev/ttyS0",
            "/dev/ttyUSB0",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo {
                name: n.to_string(),
                vid: None,
                pid: None,
                product: None,
            })
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyUSB0",
                "/dev/ttyUSB2",
                "/dev/ttyUSB10",
                "/dev/ttyACM0",
                "/dev/ttyS0",
            ]
        );
    }
}
