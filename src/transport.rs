//! Radio abstraction shared by the trainer and heart-rate links.
//!
//! Nothing here knows about FTMS or heart rate frames. Each backend maps its
//! native failures to [`ErgZoneError`] values; nothing on the real-time path
//! panics.

use async_trait::async_trait;
use futures::{
    future,
    stream::{self, BoxStream, Stream, StreamExt},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ErgZoneError, Result},
    types::{
        CharacteristicInfo, ConnectionState, Device, DeviceClass, DeviceId, Notification,
        WriteKind,
    },
};

/// Byte-oriented access to remote devices
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning for devices advertising any of the given classes
    ///
    /// The stream yields each device once per scan and stays open until
    /// [`Transport::stop_scan`] is called.
    async fn scan(&self, filter: &[DeviceClass]) -> Result<BoxStream<'static, Device>>;

    /// Stop an active scan
    async fn stop_scan(&self) -> Result<()>;

    /// Establish a link
    async fn connect(&self, device: &Device) -> Result<()>;

    /// Tear a link down
    async fn disconnect(&self, device: &Device) -> Result<()>;

    /// List the services of a connected device
    async fn discover_services(&self, device: &Device) -> Result<Vec<Uuid>>;

    /// List the characteristics of one service
    async fn discover_characteristics(
        &self,
        device: &Device,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>>;

    /// Enable or disable notifications on a characteristic
    async fn set_notify(&self, device: &Device, characteristic: Uuid, enabled: bool) -> Result<()>;

    /// Write raw bytes to a characteristic
    async fn write(
        &self,
        device: &Device,
        characteristic: Uuid,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<()>;

    /// Stream of notifications from every subscribed characteristic of a device
    ///
    /// The stream ends when the link drops.
    async fn notifications(&self, device: &Device) -> Result<BoxStream<'static, Notification>>;
}

/// Devices discovered during a scan session, keyed by identity
///
/// Repeated advertisements of the same device update its entry instead of
/// adding a duplicate.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a device; returns `true` only the first time its id is seen
    pub fn insert(&mut self, device: Device) -> bool {
        self.devices.insert(device.id.clone(), device).is_none()
    }

    /// Devices of one class, sorted by name
    #[must_use]
    pub fn of_class(&self, class: DeviceClass) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .values()
            .filter(|d| d.class == class)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Number of distinct devices seen
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether nothing was seen yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget everything (end of scan session)
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

/// Scan for a fixed window and return the distinct devices found
///
/// # Errors
///
/// Returns any transport error raised while starting or stopping the scan.
pub async fn scan_for(
    transport: &dyn Transport,
    filter: &[DeviceClass],
    window: Duration,
) -> Result<DeviceRegistry> {
    info!("Scanning for {:?} for {}ms", filter, window.as_millis());

    let mut stream = transport.scan(filter).await?;
    let mut registry = DeviceRegistry::new();

    let _ = timeout(window, async {
        while let Some(device) = stream.next().await {
            let name = device.name.clone();
            if registry.insert(device) {
                info!("Found device: {}", name);
            }
        }
    })
    .await;

    transport.stop_scan().await?;
    info!("Scan completed. Found {} device(s)", registry.len());
    Ok(registry)
}

/// Characteristic handles resolved for one profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileHandles {
    /// Service the characteristics belong to
    pub service: Uuid,
    /// Resolved characteristics, in the order requested
    pub characteristics: Vec<Uuid>,
}

/// Walk connect → service discovery → characteristic discovery → notify for one profile
///
/// `on_state` observes every connection-state transition. Every characteristic
/// in `required` must exist; the ones in `notify` get notifications enabled.
/// The link is not torn down on failure; callers reset their own state.
///
/// # Errors
///
/// Returns [`ErgZoneError::Timeout`] if the link is not up within
/// `connect_timeout`, [`ErgZoneError::Protocol`] if the service or a
/// characteristic is missing, or any transport error.
pub async fn open_profile<F>(
    transport: &dyn Transport,
    device: &Device,
    service: Uuid,
    required: &[Uuid],
    notify: &[Uuid],
    connect_timeout: Duration,
    mut on_state: F,
) -> Result<ProfileHandles>
where
    F: FnMut(ConnectionState) + Send,
{
    on_state(ConnectionState::Connecting);
    let timeout_ms = u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX);
    timeout(connect_timeout, transport.connect(device))
        .await
        .map_err(|_| ErgZoneError::Timeout { timeout_ms })?
        .map_err(|e| ErgZoneError::ConnectionFailed(e.to_string()))?;

    on_state(ConnectionState::DiscoveringServices);
    let services = transport.discover_services(device).await?;
    if !services.contains(&service) {
        return Err(ErgZoneError::Protocol(format!(
            "service {service} not found on {}",
            device.name
        )));
    }

    on_state(ConnectionState::DiscoveringCharacteristics);
    let found = transport.discover_characteristics(device, service).await?;
    let characteristics = required
        .iter()
        .map(|uuid| {
            found
                .iter()
                .find(|c| c.uuid == *uuid)
                .map(|c| c.uuid)
                .ok_or_else(|| ErgZoneError::Protocol(format!("characteristic {uuid} not found")))
        })
        .collect::<Result<Vec<_>>>()?;

    for uuid in notify {
        transport.set_notify(device, *uuid, true).await?;
    }

    debug!("Profile {} resolved on {}", service, device.name);
    Ok(ProfileHandles {
        service,
        characteristics,
    })
}

/// Identifies one connection of a device; a reconnect gets a new id
pub type LinkId = u64;

/// Radio events marshaled onto the session's serialized context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A notification from a device of the given class
    Notification {
        /// Device class the notification belongs to
        class: DeviceClass,
        /// Link the notification arrived on
        link: LinkId,
        /// Payload
        notification: Notification,
    },
    /// The device's notification stream ended
    Disconnected {
        /// Device class that lost its link
        class: DeviceClass,
        /// Link that ended
        link: LinkId,
    },
}

impl RadioEvent {
    /// Device class the event belongs to
    #[must_use]
    pub const fn class(&self) -> DeviceClass {
        match self {
            Self::Notification { class, .. } | Self::Disconnected { class, .. } => *class,
        }
    }

    /// Link the event came from
    #[must_use]
    pub const fn link(&self) -> LinkId {
        match self {
            Self::Notification { link, .. } | Self::Disconnected { link, .. } => *link,
        }
    }
}

/// End a notification stream at the first signal from `lost`
///
/// The result also ends when `notifications` itself ends.
pub fn until_lost<N, L>(notifications: N, lost: L) -> BoxStream<'static, Notification>
where
    N: Stream<Item = Notification> + Send + 'static,
    L: Stream<Item = ()> + Send + 'static,
{
    let data = notifications
        .map(Some)
        .chain(stream::once(future::ready(None)));
    stream::select(data, lost.map(|()| None))
        .take_while(|item| future::ready(item.is_some()))
        .filter_map(future::ready)
        .boxed()
}

/// Forward a device's notifications into the session channel
///
/// Spawns a task that ends, reporting [`RadioEvent::Disconnected`], when the
/// notification stream ends. Every event is tagged with `link`.
///
/// # Errors
///
/// Returns the transport error if the notification stream cannot be opened.
pub async fn forward_notifications(
    transport: Arc<dyn Transport>,
    device: &Device,
    link: LinkId,
    sender: mpsc::UnboundedSender<RadioEvent>,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut stream = transport.notifications(device).await?;
    let class = device.class;
    let name = device.name.clone();

    Ok(tokio::spawn(async move {
        while let Some(notification) = stream.next().await {
            if sender
                .send(RadioEvent::Notification {
                    class,
                    link,
                    notification,
                })
                .is_err()
            {
                return;
            }
        }
        warn!("Notification stream from {} ended", name);
        let _ = sender.send(RadioEvent::Disconnected { class, link });
    }))
}
