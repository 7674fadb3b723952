use mac_address::MacAddress;
use serde_json::{Map, Value};

use crate::mode::OperatingMode;

/// One observation of a device, as produced by the radio driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sighting {
    pub address: MacAddress,
    pub name: String,
    pub manufacturer_id: u16,
    pub rssi: i16,
    pub has_battery: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePresence {
    Present,
    Absent,
}

impl DevicePresence {
    pub fn from_present(present: bool) -> Self {
        if present {
            DevicePresence::Present
        } else {
            DevicePresence::Absent
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePresence::Present => "present",
            DevicePresence::Absent => "absent",
        }
    }
}

/// Operator requests arriving on the control topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    Restart,
    Provision,
    Scan,
    Rest,
}

impl ControlRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        match text.trim().to_ascii_lowercase().as_str() {
            "restart" | "reboot" => Some(ControlRequest::Restart),
            "provision" | "configure" => Some(ControlRequest::Provision),
            "scan" => Some(ControlRequest::Scan),
            "rest" | "pause" => Some(ControlRequest::Rest),
            _ => None,
        }
    }

    pub fn target_mode(&self) -> OperatingMode {
        match self {
            ControlRequest::Restart => OperatingMode::PendingRestart,
            ControlRequest::Provision => OperatingMode::Provisioning,
            ControlRequest::Scan => OperatingMode::Sensing,
            ControlRequest::Rest => OperatingMode::Resting,
        }
    }
}

/// A delta (or full snapshot) for one device, keyed by its rendered address.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceReport {
    pub key: String,
    pub fields: Map<String, Value>,
}

impl DeviceReport {
    pub fn payload(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_request_parse() {
        assert_eq!(ControlRequest::parse(b"restart"), Some(ControlRequest::Restart));
        assert_eq!(ControlRequest::parse(b" Provision\n"), Some(ControlRequest::Provision));
        assert_eq!(ControlRequest::parse(b"scan"), Some(ControlRequest::Scan));
        assert_eq!(ControlRequest::parse(b"dance"), None);
        assert_eq!(ControlRequest::parse(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_control_request_target_mode() {
        assert_eq!(ControlRequest::Restart.target_mode(), OperatingMode::PendingRestart);
        assert_eq!(ControlRequest::Rest.target_mode(), OperatingMode::Resting);
    }

    #[test]
    fn test_presence_strings() {
        assert_eq!(DevicePresence::from_present(true).as_str(), "present");
        assert_eq!(DevicePresence::from_present(false).as_str(), "absent");
    }
}
