use std::path::Path;

use anyhow::Context as _;
use serde_derive::Deserialize;

pub const SENSING_SECONDS_MIN: u64 = 0;
pub const SENSING_SECONDS_MAX: u64 = 3 * 60;
pub const RESTING_SECONDS_MIN: u64 = 0;
pub const RESTING_SECONDS_MAX: u64 = 24 * 60 * 60;
pub const ABSENCE_CYCLES_MIN: u32 = 1;
pub const ABSENCE_CYCLES_MAX: u32 = 10;
pub const PUBLISH_TIMEOUT_SECONDS_MIN: u64 = 10;
pub const PUBLISH_TIMEOUT_SECONDS_MAX: u64 = 24 * 60 * 60;
pub const BATTERY_CHECK_SECONDS_MIN: u64 = 60;
pub const BATTERY_CHECK_SECONDS_MAX: u64 = 7 * 24 * 60 * 60;

const DEFAULT_PUBLISHER_ID: &str = "blescan-rs";
const DEFAULT_TOPIC_PATH: &str = "blescan";

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    pub scan: Option<ScanConfig>,
    pub scanner: Option<ScannerConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub publish_timeout_seconds: Option<u64>,
    pub publish_absence: Option<bool>,
    pub status_interval_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub sensing_seconds: Option<u64>,
    pub resting_seconds: Option<u64>,
    pub absence_cycles: Option<u32>,
    pub battery_check_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScannerConfig {
    pub name: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::de::from_str(contents)?)
    }

    /// Without broker settings there is nothing to report to, so the appliance
    /// has to be provisioned first.
    pub fn needs_provisioning(&self) -> bool {
        self.mqtt.is_none()
    }

    pub fn publisher_id(&self) -> String {
        self.mqtt
            .as_ref()
            .and_then(|m| m.publisher_id.clone())
            .unwrap_or_else(|| DEFAULT_PUBLISHER_ID.to_string())
    }

    pub fn scanner_name(&self) -> String {
        self.scanner
            .as_ref()
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| self.publisher_id())
    }
}

impl MqttConfig {
    pub fn topic_path(&self) -> String {
        self.topic_path
            .clone()
            .unwrap_or_else(|| DEFAULT_TOPIC_PATH.to_string())
    }

    pub fn port(&self) -> u16 {
        // Port 0 is never a valid broker port.
        self.port.filter(|p| *p != 0).unwrap_or(1883)
    }
}

/// Timing and reporting settings after range clamping. Everything downstream
/// of the configuration layer works with these, never with raw `ScanConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub sensing_seconds: u64,
    pub resting_seconds: u64,
    pub absence_cycles: u32,
    pub publish_timeout_seconds: u64,
    pub battery_check_seconds: u64,
    pub publish_absence: bool,
    pub status_interval_seconds: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            sensing_seconds: 10,
            resting_seconds: 15,
            absence_cycles: 3,
            publish_timeout_seconds: 300,
            battery_check_seconds: 24 * 60 * 60,
            publish_absence: false,
            status_interval_seconds: 60,
        }
    }
}

impl ScanSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let defaults = ScanSettings::default();
        let scan = config.scan.clone().unwrap_or_default();
        let mqtt = config.mqtt.as_ref();

        ScanSettings {
            sensing_seconds: scan
                .sensing_seconds
                .unwrap_or(defaults.sensing_seconds)
                .clamp(SENSING_SECONDS_MIN, SENSING_SECONDS_MAX),
            resting_seconds: scan
                .resting_seconds
                .unwrap_or(defaults.resting_seconds)
                .clamp(RESTING_SECONDS_MIN, RESTING_SECONDS_MAX),
            absence_cycles: scan
                .absence_cycles
                .unwrap_or(defaults.absence_cycles)
                .clamp(ABSENCE_CYCLES_MIN, ABSENCE_CYCLES_MAX),
            battery_check_seconds: scan
                .battery_check_seconds
                .unwrap_or(defaults.battery_check_seconds)
                .clamp(BATTERY_CHECK_SECONDS_MIN, BATTERY_CHECK_SECONDS_MAX),
            publish_timeout_seconds: mqtt
                .and_then(|m| m.publish_timeout_seconds)
                .unwrap_or(defaults.publish_timeout_seconds)
                .clamp(PUBLISH_TIMEOUT_SECONDS_MIN, PUBLISH_TIMEOUT_SECONDS_MAX),
            publish_absence: mqtt
                .and_then(|m| m.publish_absence)
                .unwrap_or(defaults.publish_absence),
            status_interval_seconds: mqtt
                .and_then(|m| m.status_interval_seconds)
                .unwrap_or(defaults.status_interval_seconds)
                .max(1),
        }
    }

    /// Length of one sensing + resting cycle in seconds.
    pub fn cycle_seconds(&self) -> u64 {
        self.sensing_seconds + self.resting_seconds
    }

    pub fn absence_timeout_seconds(&self) -> u64 {
        u64::from(self.absence_cycles) * self.cycle_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"
            publish_absence = true

            [scan]
            sensing_seconds = 20
            resting_seconds = 40
            absence_cycles = 2

            [scanner]
            name = "hallway"
        "#;
        let config = AppConfig::parse(config_str).unwrap();
        assert!(config.mqtt.as_ref().unwrap().host == "localhost");
        assert!(!config.needs_provisioning());
        assert_eq!(config.scanner_name(), "hallway");

        let settings = ScanSettings::from_config(&config);
        assert_eq!(settings.sensing_seconds, 20);
        assert_eq!(settings.resting_seconds, 40);
        assert_eq!(settings.absence_timeout_seconds(), 120);
        assert!(settings.publish_absence);
        assert_eq!(settings.publish_timeout_seconds, 300);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            publish_timeout_seconds = 1

            [scan]
            sensing_seconds = 9000
            absence_cycles = 0
            battery_check_seconds = 1
        "#;
        let config = AppConfig::parse(config_str).unwrap();
        let settings = ScanSettings::from_config(&config);
        assert_eq!(settings.sensing_seconds, SENSING_SECONDS_MAX);
        assert_eq!(settings.absence_cycles, ABSENCE_CYCLES_MIN);
        assert_eq!(settings.publish_timeout_seconds, PUBLISH_TIMEOUT_SECONDS_MIN);
        assert_eq!(settings.battery_check_seconds, BATTERY_CHECK_SECONDS_MIN);
    }

    #[test]
    fn test_missing_mqtt_section_requires_provisioning() {
        let config = AppConfig::parse("[scan]\nresting_seconds = 5\n").unwrap();
        assert!(config.needs_provisioning());
        assert_eq!(config.publisher_id(), "blescan-rs");
        assert_eq!(config.scanner_name(), "blescan-rs");
    }

    #[test]
    fn test_mqtt_defaults() {
        let config = AppConfig::parse("[mqtt]\nhost = \"broker\"\nport = 0\n").unwrap();
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.port(), 1883);
        assert_eq!(mqtt.topic_path(), "blescan");
    }
}
