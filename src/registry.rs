use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use log::debug;
use mac_address::MacAddress;

use crate::address;
use crate::manufacturer;
use crate::messages::{DevicePresence, Sighting};

pub const MAX_DEVICES: usize = 1000;

pub const NAME_LENGTH: usize = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyFields(u8);

impl DirtyFields {
    pub const NONE: DirtyFields = DirtyFields(0);
    pub const NAME: DirtyFields = DirtyFields(1 << 0);
    pub const MANUFACTURER: DirtyFields = DirtyFields(1 << 1);
    pub const BATTERY: DirtyFields = DirtyFields(1 << 2);
    pub const RSSI: DirtyFields = DirtyFields(1 << 3);
    pub const PRESENCE: DirtyFields = DirtyFields(1 << 4);
    pub const ALL: DirtyFields = DirtyFields(0b1_1111);

    pub fn contains(self, other: DirtyFields) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: DirtyFields) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: DirtyFields) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self == DirtyFields::NONE
    }
}

impl BitOr for DirtyFields {
    type Output = DirtyFields;

    fn bitor(self, rhs: DirtyFields) -> DirtyFields {
        DirtyFields(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug)]
pub struct DeviceRecord {
    address: MacAddress,
    pub display_name: String,
    pub manufacturer_id: u16,
    pub manufacturer_name: &'static str,
    pub rssi: i16,
    pub has_battery: bool,
    pub battery_level: Option<u8>,
    pub last_seen: u64,
    pub last_published: u64,
    pub last_battery_check: u64,
    pub present: bool,
    pub dirty: DirtyFields,
}

impl DeviceRecord {
    fn new(sighting: &Sighting, now: u64) -> Self {
        DeviceRecord {
            address: sighting.address,
            display_name: truncate_name(&sighting.name),
            manufacturer_id: sighting.manufacturer_id,
            manufacturer_name: manufacturer::name(sighting.manufacturer_id),
            rssi: sighting.rssi,
            has_battery: sighting.has_battery,
            battery_level: None,
            last_seen: now,
            last_published: 0,
            last_battery_check: 0,
            present: true,
            dirty: DirtyFields::ALL,
        }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    fn merge(&mut self, sighting: &Sighting, now: u64) {
        let name = truncate_name(&sighting.name);
        if !name.is_empty() && name != self.display_name {
            self.display_name = name;
            self.dirty.insert(DirtyFields::NAME);
        }
        if self.manufacturer_id != sighting.manufacturer_id {
            self.manufacturer_id = sighting.manufacturer_id;
            self.manufacturer_name = manufacturer::name(sighting.manufacturer_id);
            self.dirty.insert(DirtyFields::MANUFACTURER);
        }
        if self.has_battery != sighting.has_battery {
            self.has_battery = sighting.has_battery;
            self.dirty.insert(DirtyFields::BATTERY);
        }
        if self.rssi != sighting.rssi {
            self.rssi = sighting.rssi;
            self.dirty.insert(DirtyFields::RSSI);
        }
        if !self.present {
            self.present = true;
            self.dirty.insert(DirtyFields::PRESENCE);
        }
        self.last_seen = now;
    }
}

fn truncate_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .take(NAME_LENGTH)
        .collect()
}

// Slots are never freed; once full, the tail slot is reused.
struct Slot {
    record: DeviceRecord,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct DeviceRegistry {
    slots: Vec<Slot>,
    index: HashMap<MacAddress, usize>,
    // most recently touched
    head: Option<usize>,
    // least recently touched, next to be evicted
    tail: Option<usize>,
    capacity: usize,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        DeviceRegistry::new(MAX_DEVICES)
    }
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DeviceRegistry {
            slots: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn upsert(&mut self, sighting: &Sighting, now: u64) -> bool {
        if let Some(&slot) = self.index.get(&sighting.address) {
            self.unlink(slot);
            self.push_front(slot);
            self.slots[slot].record.merge(sighting, now);
            return true;
        }

        let record = DeviceRecord::new(sighting, now);
        let slot = if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                record,
                prev: None,
                next: None,
            });
            debug!("Number of devices in registry: {}", self.slots.len());
            self.slots.len() - 1
        } else {
            let Some(slot) = self.tail else {
                return false;
            };
            self.unlink(slot);
            let evicted = std::mem::replace(&mut self.slots[slot].record, record);
            self.index.remove(&evicted.address);
            debug!(
                "Registry full ({} devices), evicted {}",
                self.capacity,
                address::display(&evicted.address)
            );
            slot
        };

        self.push_front(slot);
        self.index.insert(sighting.address, slot);
        true
    }

    pub fn lookup(&self, address: &MacAddress) -> Option<&DeviceRecord> {
        self.index.get(address).map(|&slot| &self.slots[slot].record)
    }

    pub fn apply_battery_level(&mut self, address: &MacAddress, level: u8) -> bool {
        let Some(&slot) = self.index.get(address) else {
            return false;
        };
        let record = &mut self.slots[slot].record;
        if record.battery_level == Some(level) {
            return false;
        }
        record.battery_level = Some(level);
        record.dirty.insert(DirtyFields::BATTERY);
        true
    }

    /// Most recently touched first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            registry: self,
            cursor: self.head,
        }
    }

    pub fn for_each_mut<F>(&mut self, mut visitor: F)
    where
        F: FnMut(&mut DeviceRecord),
    {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            cursor = self.slots[slot].next;
            visitor(&mut self.slots[slot].record);
        }
    }

    pub fn listing(&self) -> Vec<DeviceListing> {
        self.iter().map(DeviceListing::from).collect()
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None if self.head == Some(slot) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None if self.tail == Some(slot) => self.tail = prev,
            None => {}
        }
        self.slots[slot].prev = None;
        self.slots[slot].next = None;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].next = self.head;
        if let Some(head) = self.head {
            self.slots[head].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}

pub struct Iter<'a> {
    registry: &'a DeviceRegistry,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a DeviceRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = &self.registry.slots[self.cursor?];
        self.cursor = slot.next;
        Some(&slot.record)
    }
}

/// Rough log-distance estimate, assuming -59 dBm at one metre in free space.
pub fn estimate_distance(rssi: i16) -> f64 {
    const MEASURED_POWER: f64 = -59.0;
    const PATH_LOSS_EXPONENT: f64 = 2.0;
    let metres = 10f64.powf((MEASURED_POWER - f64::from(rssi)) / (10.0 * PATH_LOSS_EXPONENT));
    (metres * 10.0).round() / 10.0
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceListing {
    pub presence: DevicePresence,
    pub address: String,
    pub name: String,
    pub manufacturer_id: String,
    pub manufacturer: String,
    pub rssi: i16,
    pub distance_m: f64,
    pub last_seen: u64,
    pub battery: String,
}

impl From<&DeviceRecord> for DeviceListing {
    fn from(record: &DeviceRecord) -> Self {
        let known_manufacturer = record.manufacturer_id != manufacturer::UNKNOWN;
        DeviceListing {
            presence: DevicePresence::from_present(record.present),
            address: address::display(&record.address),
            name: or_dash(&record.display_name),
            manufacturer_id: if known_manufacturer {
                manufacturer::id_hex(record.manufacturer_id)
            } else {
                "-".to_string()
            },
            manufacturer: if known_manufacturer {
                or_dash(record.manufacturer_name)
            } else {
                "-".to_string()
            },
            rssi: record.rssi,
            distance_m: estimate_distance(record.rssi),
            last_seen: record.last_seen,
            battery: match (record.has_battery, record.battery_level) {
                (true, Some(level)) => level.to_string(),
                _ => "-".to_string(),
            },
        }
    }
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

impl fmt::Display for DeviceListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<7} {} {:<20} {:<6} {:<24} {:>4}dBm {:>6.1}m seen@{} battery:{}",
            self.presence.as_str(),
            self.address,
            self.name,
            self.manufacturer_id,
            self.manufacturer,
            self.rssi,
            self.distance_m,
            self.last_seen,
            self.battery
        )
    }
}
