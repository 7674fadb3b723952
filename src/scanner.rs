use std::sync::Arc;

use anyhow::Context as _;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    Central as _, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use futures::StreamExt as _;
use log::{debug, info, trace, warn};
use mac_address::MacAddress;
use tokio::sync::Mutex;

use crate::battery::BATTERY_SERVICE;
use crate::clock::Clock;
use crate::manufacturer;
use crate::messages::Sighting;
use crate::mode::{OperatingMode, OperatingModeMachine};
use crate::registry::DeviceRegistry;

pub struct Scanner {
    adapter: btleplug::platform::Adapter,
}

impl Scanner {
    /// Use the first bluetooth adapter on the system.
    pub async fn first_adapter() -> anyhow::Result<Self> {
        let bt_manager = btleplug::platform::Manager::new()
            .await
            .context("initialising bluetooth")?;
        let adapter = bt_manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .context("no bluetooth adapter found")?;
        info!(
            "Using bluetooth adapter {}",
            adapter.adapter_info().await.unwrap_or_default()
        );
        Ok(Scanner { adapter })
    }

    pub fn adapter(&self) -> btleplug::platform::Adapter {
        self.adapter.clone()
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        debug!("Starting scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        debug!("Stopping scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    /// Feed advertisements into the registry for as long as the adapter
    /// produces events. Advertisements outside of sensing are dropped.
    pub async fn run(
        &self,
        registry: Arc<Mutex<DeviceRegistry>>,
        mode: Arc<Mutex<OperatingModeMachine>>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<()> {
        let mut events = self.adapter.events().await?;

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                | CentralEvent::ServicesAdvertisement { id, .. } => id,
                _ => continue,
            };

            if !mode.lock().await.is_in(OperatingMode::Sensing) {
                continue;
            }

            let peripheral = match self.adapter.peripheral(&id).await {
                Ok(peripheral) => peripheral,
                Err(err) => {
                    warn!("Error looking up peripheral {:?}: {:?}", id, err);
                    continue;
                }
            };
            let properties = match peripheral.properties().await {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Error reading properties of {:?}: {:?}", id, err);
                    continue;
                }
            };

            let sighting = sighting_from_properties(&properties);
            trace!("Sighting: {:?}", sighting);
            registry.lock().await.upsert(&sighting, clock.now());
        }

        info!("No more bluetooth events");
        Ok(())
    }
}

pub fn sighting_from_properties(properties: &PeripheralProperties) -> Sighting {
    Sighting {
        address: MacAddress::new(properties.address.into_inner()),
        name: properties.local_name.clone().unwrap_or_default(),
        manufacturer_id: properties
            .manufacturer_data
            .keys()
            .min()
            .copied()
            .unwrap_or(manufacturer::UNKNOWN),
        rssi: properties.rssi.unwrap_or_default(),
        has_battery: properties
            .services
            .contains(&uuid_from_u16(BATTERY_SERVICE)),
    }
}
