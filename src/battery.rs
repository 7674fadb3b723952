use std::future::Future;

use anyhow::{Context as _, anyhow};
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{BDAddr, Central as _, Peripheral as _};
use log::{debug, warn};
use mac_address::MacAddress;
use tokio::sync::Mutex;

use crate::address;
use crate::registry::{DeviceRecord, DeviceRegistry};

pub const BATTERY_SERVICE: u16 = 0x180F;
pub const BATTERY_LEVEL_CHARACTERISTIC: u16 = 0x2A19;

// An attempt counts whether or not the read succeeds.
#[derive(Debug, Clone, Copy)]
pub struct BatteryPoller {
    check_interval: u64,
}

impl BatteryPoller {
    pub fn new(check_interval_seconds: u64) -> Self {
        BatteryPoller {
            check_interval: check_interval_seconds,
        }
    }

    pub fn is_due(&self, record: &DeviceRecord, now: u64) -> bool {
        record.has_battery
            && record.present
            && now.saturating_sub(record.last_battery_check) > self.check_interval
    }

    pub fn claim(&self, record: &mut DeviceRecord, now: u64) -> bool {
        if !self.is_due(record, now) {
            return false;
        }
        record.last_battery_check = now;
        true
    }
}

pub trait BatteryReader {
    fn read_level(&self, address: MacAddress) -> impl Future<Output = anyhow::Result<u8>> + Send;
}

/// Reads the Battery Level characteristic over a short-lived connection.
#[derive(Clone)]
pub struct GattBatteryReader {
    adapter: btleplug::platform::Adapter,
}

impl GattBatteryReader {
    pub fn new(adapter: btleplug::platform::Adapter) -> Self {
        GattBatteryReader { adapter }
    }
}

impl BatteryReader for GattBatteryReader {
    async fn read_level(&self, address: MacAddress) -> anyhow::Result<u8> {
        let target = BDAddr::from(address.bytes());
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == target)
            .ok_or_else(|| anyhow!("peripheral no longer known to the adapter"))?;

        peripheral.connect().await.context("connecting")?;
        let level: anyhow::Result<u8> = async {
            peripheral.discover_services().await?;
            let characteristic = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == uuid_from_u16(BATTERY_LEVEL_CHARACTERISTIC))
                .ok_or_else(|| anyhow!("no battery level characteristic"))?;
            let value = peripheral.read(&characteristic).await?;
            parse_battery_level(&value).ok_or_else(|| anyhow!("empty battery level value"))
        }
        .await;

        if let Err(err) = peripheral.disconnect().await {
            debug!("Error disconnecting from {}: {:?}", address::display(&address), err);
        }
        level
    }
}

pub fn parse_battery_level(value: &[u8]) -> Option<u8> {
    value.first().map(|level| (*level).min(100))
}

/// Returns whether the read succeeded.
pub async fn poll<R: BatteryReader>(
    reader: &R,
    registry: &Mutex<DeviceRegistry>,
    address: MacAddress,
) -> bool {
    if registry.lock().await.lookup(&address).is_none() {
        debug!("{} was evicted before its battery check", address::display(&address));
        return false;
    }
    match reader.read_level(address).await {
        Ok(level) => {
            let changed = registry.lock().await.apply_battery_level(&address, level);
            debug!(
                "Battery of {} at {}%{}",
                address::display(&address),
                level,
                if changed { " (changed)" } else { "" }
            );
            true
        }
        Err(err) => {
            warn!(
                "Battery check for {} failed: {:#}",
                address::display(&address),
                err
            );
            false
        }
    }
}
