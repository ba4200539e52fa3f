use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{ErgZoneError, Result},
    transport::{until_lost, Transport},
    types::{
        CharacteristicInfo, CharacteristicProps, Device, DeviceClass, DeviceId, Notification,
        WriteKind,
    },
};

/// How often a live link is checked between adapter events
const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Transport backed by the host Bluetooth adapter
pub struct BtleTransport {
    _manager: Manager,
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
}

impl BtleTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`ErgZoneError::Ble`] if the adapter cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ErgZoneError::DeviceNotFound)?;

        Ok(Self {
            _manager: manager,
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn peripheral(&self, device: &Device) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(&device.id)
            .cloned()
            .ok_or(ErgZoneError::DeviceNotFound)
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| ErgZoneError::Protocol(format!("characteristic {uuid} not found")))
    }
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId(format!("{id:?}"))
}

/// Resolve a discovery event into a classified device, remembering its peripheral
async fn discovered_device(
    adapter: &Adapter,
    peripherals: &Mutex<HashMap<DeviceId, Peripheral>>,
    id: &PeripheralId,
    filter: &[DeviceClass],
) -> Option<Device> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let class = DeviceClass::from_services(&properties.services)?;
    if !filter.contains(&class) {
        return None;
    }

    let device = Device::new(
        device_id(id),
        properties
            .local_name
            .unwrap_or_else(|| format!("Unknown {class}")),
        class,
    );
    peripherals.lock().await.insert(device.id.clone(), peripheral);
    Some(device)
}

#[async_trait]
impl Transport for BtleTransport {
    async fn scan(&self, filter: &[DeviceClass]) -> Result<BoxStream<'static, Device>> {
        info!("Starting scan for {:?}", filter);

        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: filter.iter().map(|c| c.service_uuid()).collect(),
            })
            .await?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let filter = filter.to_vec();

        let devices = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                let peripherals = peripherals.clone();
                let filter = filter.clone();
                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            discovered_device(&adapter, &peripherals, &id, &filter).await
                        }
                        _ => None,
                    }
                }
            })
            .scan(HashSet::new(), |seen, device: Device| {
                let fresh = seen.insert(device.id.clone());
                future::ready(Some(fresh.then_some(device)))
            })
            .filter_map(future::ready);

        Ok(devices.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device: &Device) -> Result<()> {
        info!("Connecting to device: {}", device.name);
        self.peripheral(device)
            .await?
            .connect()
            .await
            .map_err(|e| ErgZoneError::ConnectionFailed(e.to_string()))
    }

    async fn disconnect(&self, device: &Device) -> Result<()> {
        info!("Disconnecting from device: {}", device.name);
        self.peripheral(device).await?.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, device: &Device) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(device).await?;
        peripheral.discover_services().await?;
        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        device: &Device,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>> {
        let peripheral = self.peripheral(device).await?;
        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| ErgZoneError::Protocol(format!("service {service} not found")))?;

        Ok(service
            .characteristics
            .iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                props: CharacteristicProps {
                    notify: c.properties.contains(CharPropFlags::NOTIFY),
                    indicate: c.properties.contains(CharPropFlags::INDICATE),
                    write: c.properties.contains(CharPropFlags::WRITE),
                },
            })
            .collect())
    }

    async fn set_notify(&self, device: &Device, characteristic: Uuid, enabled: bool) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        if enabled {
            peripheral.subscribe(&characteristic).await?;
        } else {
            peripheral.unsubscribe(&characteristic).await?;
        }
        Ok(())
    }

    async fn write(
        &self,
        device: &Device,
        characteristic: Uuid,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        debug!("Writing to {}: {:02X?}", characteristic, data);
        let peripheral = self.peripheral(device).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };

        peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| ErgZoneError::Protocol(format!("Failed to write: {e}")))
    }

    async fn notifications(&self, device: &Device) -> Result<BoxStream<'static, Notification>> {
        let peripheral = self.peripheral(device).await?;
        let notifications = peripheral.notifications().await?.map(|n| Notification {
            characteristic: n.uuid,
            value: n.value,
        });

        // Not every platform ends the notification stream when the link drops
        let id = peripheral.id();
        let disconnects = self.adapter.events().await?.filter_map(move |event| {
            future::ready(match event {
                CentralEvent::DeviceDisconnected(gone) if gone == id => Some(()),
                _ => None,
            })
        });
        let checks = stream::unfold(peripheral, |peripheral| async move {
            tokio::time::sleep(LINK_CHECK_INTERVAL).await;
            let connected = peripheral.is_connected().await.unwrap_or(false);
            Some((connected, peripheral))
        })
        .filter_map(|connected| future::ready((!connected).then_some(())));

        Ok(until_lost(notifications, stream::select(disconnects, checks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FTMS_SERVICE_UUID, HEART_RATE_SERVICE_UUID};

    #[test]
    fn test_scan_filter_services() {
        let services: Vec<Uuid> = [DeviceClass::Trainer, DeviceClass::HeartRateMonitor]
            .iter()
            .map(|c| c.service_uuid())
            .collect();
        assert_eq!(services, vec![FTMS_SERVICE_UUID, HEART_RATE_SERVICE_UUID]);
    }
}
