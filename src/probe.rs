use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::controller::Controller;
use crate::serial::{SerialError, SerialLink};

/// Lines read while listening for the boot banner before giving up (≈3s at
/// the probe's 200ms read timeout) and, if nothing showed up, again after a
/// soft reset.
const BANNER_READ_ATTEMPTS: usize = 15;
const PROBE_BAUD_RATE: u32 = 115_200;
const PROBE_READ_TIMEOUT_MS: u64 = 200;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no compatible GRBL device found; checked {count} port(s):\n{report}")]
    NoDeviceFound { count: usize, report: String },
}

/// A serial port as reported by the OS, the minimum shape the prober needs.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub device: String,
    pub description: String,
}

impl From<&serialport::SerialPortInfo> for PortInfo {
    fn from(info: &serialport::SerialPortInfo) -> Self {
        let description = match &info.port_type {
            serialport::SerialPortType::UsbPort(usb) => usb
                .product
                .clone()
                .unwrap_or_else(|| "USB serial".to_string()),
            _ => String::new(),
        };

        Self {
            device: info.port_name.clone(),
            description,
        }
    }
}

/// A port is a candidate if its description mentions "usb"/"arduino" or its
/// device path mentions "arduino"/"ttyUSB", case-insensitively, in either
/// field — unifying the description-vs-device ambiguity noted in the spec.
fn is_candidate(port: &PortInfo) -> bool {
    let description = port.description.to_lowercase();
    let device = port.device.to_lowercase();

    description.contains("usb")
        || description.contains("arduino")
        || device.contains("arduino")
        || device.contains("ttyusb")
}

enum RejectReason {
    InvalidResponse,
    NotAMatch,
}

impl RejectReason {
    fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidResponse => "invalid response",
            RejectReason::NotAMatch => "not a match",
        }
    }
}

/// Reads up to `BANNER_READ_ATTEMPTS` lines from `link`, returning `true` the
/// moment a GRBL boot banner ("Grbl ...") is seen.
fn banner_seen(link: &SerialLink) -> bool {
    for _ in 0..BANNER_READ_ATTEMPTS {
        match link.read_line() {
            Ok(line) if line.starts_with("Grbl ") => {
                info!("{}", line);
                return true;
            }
            Ok(_) => continue,
            Err(SerialError::Timeout) => continue,
            Err(_) => return false,
        }
    }
    false
}

fn try_open(port: &str) -> Option<SerialLink> {
    let link = SerialLink::open(
        port,
        PROBE_BAUD_RATE,
        Duration::from_millis(PROBE_READ_TIMEOUT_MS),
    )
    .ok()?;

    if banner_seen(&link) {
        return Some(link);
    }

    info!("No banner from '{}', triggering a soft reset", port);
    if link.soft_reset().is_err() {
        return None;
    }

    if banner_seen(&link) {
        Some(link)
    } else {
        None
    }
}

/// Enumerates serial ports, tries each candidate in OS-enumeration order, and
/// returns a `Controller` wrapping the first device that announces itself as
/// GRBL. On exhaustion, reports every rejected port and why.
pub fn probe_and_open(ports: &[PortInfo]) -> Result<Controller, ProbeError> {
    let candidates: Vec<&PortInfo> = ports.iter().filter(|p| is_candidate(p)).collect();

    for port in &candidates {
        if let Some(link) = try_open(&port.device) {
            return Ok(Controller::new(link));
        }
    }

    let report = ports
        .iter()
        .map(|p| {
            let reason = if candidates.iter().any(|c| c.device == p.device) {
                RejectReason::InvalidResponse
            } else {
                RejectReason::NotAMatch
            };
            format!("\t{}: {} [{}]", p.device, p.description, reason.as_str())
        })
        .collect::<Vec<_>>()
        .join("\n");

    Err(ProbeError::NoDeviceFound {
        count: ports.len(),
        report,
    })
}

/// Convenience wrapper that sources the port list from the OS.
pub fn probe_and_open_system() -> Result<Controller, ProbeError> {
    let ports = serialport::available_ports().unwrap_or_default();
    let ports: Vec<PortInfo> = ports.iter().map(PortInfo::from).collect();
    probe_and_open(&ports)
}

/// Runs the same banner handshake as [`probe_and_open`] against a single,
/// already-known port (e.g. one pinned in config) instead of a candidate
/// list, falling back to a full OS sweep if that port doesn't answer.
pub fn probe_and_open_preferring(port: &str) -> Result<Controller, ProbeError> {
    if let Some(link) = try_open(port) {
        return Ok(Controller::new(link));
    }

    info!(
        "Configured port '{}' did not answer the GRBL handshake; falling back to a full sweep",
        port
    );
    probe_and_open_system()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(device: &str, description: &str) -> PortInfo {
        PortInfo {
            device: device.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn candidate_matches_either_field_case_insensitively() {
        assert!(is_candidate(&port("/dev/ttyACM0", "USB-Serial Device")));
        assert!(is_candidate(&port("/dev/ttyACM0", "Arduino Uno")));
        assert!(is_candidate(&port("/dev/ttyUSB0", "Unknown")));
        assert!(is_candidate(&port("/dev/cu.arduino-1", "Unknown")));
        assert!(!is_candidate(&port("/dev/ttyS0", "Bluetooth modem")));
    }

    #[test]
    fn empty_port_list_reports_no_device_found() {
        let err = probe_and_open(&[]).unwrap_err();
        match err {
            ProbeError::NoDeviceFound { count, .. } => assert_eq!(count, 0),
        }
    }
}
