use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use mac_address::MacAddress;
use serde_json::{Map, Value, json};

use crate::address;
use crate::battery::BatteryPoller;
use crate::config::ScanSettings;
use crate::manufacturer;
use crate::messages::{DevicePresence, DeviceReport};
use crate::registry::{DeviceRecord, DeviceRegistry, DirtyFields};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    pub absence_timeout: u64,
    pub publish_timeout: u64,
    pub publish_absence: bool,
}

impl PublishPolicy {
    pub fn from_settings(settings: &ScanSettings) -> Self {
        PublishPolicy {
            absence_timeout: settings.absence_timeout_seconds(),
            publish_timeout: settings.publish_timeout_seconds,
            publish_absence: settings.publish_absence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishDecision {
    Skip,
    Emit {
        fields: DirtyFields,
        include_state: bool,
    },
}

/// Absence must already have been applied by [`refresh_presence`].
pub fn decide(
    record: &DeviceRecord,
    now: u64,
    policy: &PublishPolicy,
    publish_all: bool,
) -> PublishDecision {
    let stale = record.present && now.saturating_sub(record.last_published) > policy.publish_timeout;
    let include_state = record.present || policy.publish_absence;

    let mut fields = if publish_all {
        DirtyFields::ALL
    } else {
        record.dirty
    };
    if !include_state {
        fields.remove(DirtyFields::PRESENCE);
    }

    if fields.is_empty() && !stale {
        return PublishDecision::Skip;
    }
    PublishDecision::Emit {
        fields,
        include_state,
    }
}

pub fn refresh_presence(record: &mut DeviceRecord, now: u64, absence_timeout: u64) -> bool {
    if record.present && now.saturating_sub(record.last_seen) > absence_timeout {
        record.present = false;
        record.dirty.insert(DirtyFields::PRESENCE);
        return true;
    }
    false
}

#[derive(Debug, Clone, Default)]
pub struct ScannerIdentity {
    pub name: String,
    pub client_id: String,
}

pub fn build_report(
    record: &DeviceRecord,
    fields: DirtyFields,
    include_state: bool,
    scanner: &ScannerIdentity,
) -> DeviceReport {
    let mut payload = Map::new();

    if include_state {
        payload.insert(
            "state".to_string(),
            json!(DevicePresence::from_present(record.present).as_str()),
        );
    }
    payload.insert("last_seen".to_string(), json!(record.last_seen));
    payload.insert("Scanner".to_string(), json!(scanner.name));
    payload.insert("ScannerCID".to_string(), json!(scanner.client_id));

    if fields.contains(DirtyFields::NAME) {
        payload.insert("Name".to_string(), json!(record.display_name));
    }
    if fields.contains(DirtyFields::MANUFACTURER) {
        payload.insert(
            "ManufacturerId".to_string(),
            json!(manufacturer::id_hex(record.manufacturer_id)),
        );
        payload.insert("Manufacturer".to_string(), json!(record.manufacturer_name));
    }
    if fields.contains(DirtyFields::BATTERY) {
        payload.insert("Battery".to_string(), json!(u8::from(record.has_battery)));
        payload.insert(
            "BatteryLevel".to_string(),
            json!(record.battery_level.unwrap_or(0)),
        );
    }
    if fields.contains(DirtyFields::RSSI) {
        payload.insert("RSSI".to_string(), Value::from(record.rssi));
    }

    DeviceReport {
        key: address::device_key(&record.address()),
        fields: payload,
    }
}

/// Asks for one full snapshot of every device on the next tick.
#[derive(Debug, Clone, Default)]
pub struct PublishAllFlag(Arc<AtomicBool>);

impl PublishAllFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub reports: Vec<DeviceReport>,
    pub battery_poll: Option<MacAddress>,
}

pub struct PublishScheduler {
    policy: PublishPolicy,
    battery: BatteryPoller,
    scanner: ScannerIdentity,
}

impl PublishScheduler {
    pub fn new(settings: &ScanSettings, scanner: ScannerIdentity) -> Self {
        PublishScheduler {
            policy: PublishPolicy::from_settings(settings),
            battery: BatteryPoller::new(settings.battery_check_seconds),
            scanner,
        }
    }

    pub fn apply_settings(&mut self, settings: &ScanSettings) {
        self.policy = PublishPolicy::from_settings(settings);
        self.battery = BatteryPoller::new(settings.battery_check_seconds);
        info!(
            "Publish policy: absent after {}s, refresh after {}s, publish absence: {}",
            self.policy.absence_timeout, self.policy.publish_timeout, self.policy.publish_absence
        );
    }

    pub fn tick(
        &self,
        registry: &mut DeviceRegistry,
        now: u64,
        publish_all: bool,
        battery_idle: bool,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let mut battery_idle = battery_idle;

        registry.for_each_mut(|record| {
            if refresh_presence(record, now, self.policy.absence_timeout) {
                debug!("{} is now absent", address::display(&record.address()));
            }
            if battery_idle && self.battery.claim(record, now) {
                outcome.battery_poll = Some(record.address());
                battery_idle = false;
            }
            if let Some(report) = self.publish(record, now, publish_all) {
                outcome.reports.push(report);
            }
        });

        outcome
    }

    fn publish(&self, record: &mut DeviceRecord, now: u64, publish_all: bool) -> Option<DeviceReport> {
        let PublishDecision::Emit {
            fields,
            include_state,
        } = decide(record, now, &self.policy, publish_all)
        else {
            return None;
        };

        let report = build_report(record, fields, include_state, &self.scanner);
        record.dirty.remove(fields);
        record.last_published = now;
        debug!("Publishing {}: {}", report.key, report.payload());
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Sighting;

    fn settings() -> ScanSettings {
        ScanSettings {
            sensing_seconds: 10,
            resting_seconds: 5,
            absence_cycles: 2,
            publish_timeout_seconds: 300,
            battery_check_seconds: 600,
            publish_absence: false,
            status_interval_seconds: 60,
        }
    }

    fn scheduler(settings: &ScanSettings) -> PublishScheduler {
        PublishScheduler::new(
            settings,
            ScannerIdentity {
                name: "hallway".to_string(),
                client_id: "blescan-1".to_string(),
            },
        )
    }

    fn sensor() -> Sighting {
        Sighting {
            address: MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            name: "Sensor1".to_string(),
            manufacturer_id: 0x004C,
            rssi: -60,
            has_battery: true,
        }
    }

    #[test]
    fn test_first_sighting_reports_everything_once() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);

        let outcome = scheduler.tick(&mut registry, 1000, false, true);
        assert_eq!(outcome.reports.len(), 1);
        let report = &outcome.reports[0];
        assert_eq!(report.key, "AA-BB-CC-DD-EE-FF");
        assert_eq!(
            Value::Object(report.fields.clone()),
            json!({
                "state": "present",
                "last_seen": 1000,
                "Scanner": "hallway",
                "ScannerCID": "blescan-1",
                "Name": "Sensor1",
                "ManufacturerId": "0x004C",
                "Manufacturer": "Apple, Inc.",
                "Battery": 1,
                "BatteryLevel": 0,
                "RSSI": -60,
            })
        );
        assert_eq!(outcome.battery_poll, Some(sensor().address));

        let record = registry.lookup(&sensor().address).unwrap();
        assert!(record.dirty.is_empty());
        assert_eq!(record.last_published, 1000);

        let outcome = scheduler.tick(&mut registry, 1001, false, true);
        assert!(outcome.reports.is_empty());
        assert_eq!(outcome.battery_poll, None);
    }

    #[test]
    fn test_only_changed_fields_are_reported() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);

        let mut moved = sensor();
        moved.rssi = -72;
        registry.upsert(&moved, 1005);
        let outcome = scheduler.tick(&mut registry, 1005, false, true);

        assert_eq!(outcome.reports.len(), 1);
        let fields = &outcome.reports[0].fields;
        assert_eq!(fields["RSSI"], json!(-72));
        assert_eq!(fields["state"], json!("present"));
        assert_eq!(fields["last_seen"], json!(1005));
        assert!(!fields.contains_key("Name"));
        assert!(!fields.contains_key("BatteryLevel"));
        assert!(registry.lookup(&sensor().address).unwrap().dirty.is_empty());
    }

    #[test]
    fn test_unchanged_sighting_is_silent() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);

        registry.upsert(&sensor(), 1010);
        assert!(scheduler.tick(&mut registry, 1010, false, true).reports.is_empty());
        assert_eq!(registry.lookup(&sensor().address).unwrap().last_seen, 1010);
    }

    #[test]
    fn test_absence_after_whole_cycles() {
        // 2 cycles of 10s sensing + 5s resting.
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);

        scheduler.tick(&mut registry, 1030, false, true);
        assert!(registry.lookup(&sensor().address).unwrap().present);

        let outcome = scheduler.tick(&mut registry, 1031, false, true);
        let record = registry.lookup(&sensor().address).unwrap();
        assert!(!record.present);
        // Absence is not reported unless asked for.
        assert!(outcome.reports.is_empty());
        assert!(record.dirty.contains(DirtyFields::PRESENCE));
    }

    #[test]
    fn test_absence_is_reported_when_enabled() {
        let settings = ScanSettings {
            publish_absence: true,
            ..settings()
        };
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);

        let outcome = scheduler.tick(&mut registry, 1031, false, true);
        assert_eq!(outcome.reports.len(), 1);
        let fields = &outcome.reports[0].fields;
        assert_eq!(fields["state"], json!("absent"));
        assert_eq!(fields["last_seen"], json!(1000));
        assert!(!fields.contains_key("RSSI"));

        assert!(scheduler.tick(&mut registry, 1032, false, true).reports.is_empty());
    }

    #[test]
    fn test_return_after_absence_reports_presence() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);
        scheduler.tick(&mut registry, 1031, false, true);

        registry.upsert(&sensor(), 1040);
        let outcome = scheduler.tick(&mut registry, 1040, false, true);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].fields["state"], json!("present"));
        assert!(registry.lookup(&sensor().address).unwrap().dirty.is_empty());
    }

    #[test]
    fn test_stale_device_is_refreshed() {
        let settings = ScanSettings {
            absence_cycles: 10,
            sensing_seconds: 60,
            ..settings()
        };
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);

        registry.upsert(&sensor(), 1250);
        assert!(scheduler.tick(&mut registry, 1300, false, true).reports.is_empty());

        let outcome = scheduler.tick(&mut registry, 1301, false, true);
        assert_eq!(outcome.reports.len(), 1);
        let fields = &outcome.reports[0].fields;
        assert_eq!(fields["state"], json!("present"));
        assert_eq!(fields["last_seen"], json!(1250));
        assert!(!fields.contains_key("Name"));
        assert_eq!(
            registry.lookup(&sensor().address).unwrap().last_published,
            1301
        );
    }

    #[test]
    fn test_publish_all_sends_full_snapshot() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);

        let outcome = scheduler.tick(&mut registry, 1001, true, true);
        assert_eq!(outcome.reports.len(), 1);
        let fields = &outcome.reports[0].fields;
        for key in ["state", "Name", "ManufacturerId", "Manufacturer", "Battery", "BatteryLevel", "RSSI"] {
            assert!(fields.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_publish_all_keeps_absence_private() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        scheduler.tick(&mut registry, 1000, false, true);
        scheduler.tick(&mut registry, 1031, false, true);

        let outcome = scheduler.tick(&mut registry, 1032, true, true);
        assert_eq!(outcome.reports.len(), 1);
        assert!(!outcome.reports[0].fields.contains_key("state"));
        // Presence was never reported, so it stays flagged.
        assert!(
            registry
                .lookup(&sensor().address)
                .unwrap()
                .dirty
                .contains(DirtyFields::PRESENCE)
        );
    }

    #[test]
    fn test_one_battery_poll_per_tick() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        for last in 1..=3u8 {
            registry.upsert(
                &Sighting {
                    address: MacAddress::new([0, 0, 0, 0, 0, last]),
                    ..sensor()
                },
                1000,
            );
        }

        let polled: Vec<_> = (0..4)
            .filter_map(|i| scheduler.tick(&mut registry, 1000 + i, false, true).battery_poll)
            .collect();
        assert_eq!(polled.len(), 3);
        assert_eq!(polled[0], MacAddress::new([0, 0, 0, 0, 0, 3]));
        assert!(registry.iter().all(|r| r.last_battery_check >= 1000));
    }

    #[test]
    fn test_busy_battery_reader_defers_poll() {
        let settings = settings();
        let scheduler = scheduler(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);

        assert_eq!(scheduler.tick(&mut registry, 1000, false, false).battery_poll, None);
        assert_eq!(
            scheduler.tick(&mut registry, 1001, false, true).battery_poll,
            Some(sensor().address)
        );
    }

    #[test]
    fn test_publish_all_flag() {
        let flag = PublishAllFlag::default();
        let shared = flag.clone();
        assert!(!flag.take());
        shared.raise();
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn test_decide_is_pure() {
        let settings = settings();
        let policy = PublishPolicy::from_settings(&settings);
        let mut registry = DeviceRegistry::default();
        registry.upsert(&sensor(), 1000);
        let record = registry.lookup(&sensor().address).unwrap();

        let first = decide(record, 1000, &policy, false);
        assert_eq!(first, decide(record, 1000, &policy, false));
        assert_eq!(
            first,
            PublishDecision::Emit {
                fields: DirtyFields::ALL,
                include_state: true,
            }
        );
        assert_eq!(policy.absence_timeout, 30);
    }
}
