//! [`Transport`] backed by the platform Bluetooth LE stack via `bluest`.

use crate::session::{Advertisement, GattProfile, Transport, TransportError};
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

fn backend(err: bluest::Error) -> TransportError {
    TransportError::Backend(err.to_string())
}

/// One BLE link. Build a new instance for every connection attempt.
#[derive(Default)]
pub struct BluestTransport {
    adapter: Option<Adapter>,
    device: Option<Device>,
    notify: Option<Characteristic>,
    write: Option<Characteristic>,
    forwarder: Option<JoinHandle<()>>,
}

impl BluestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&mut self) -> Result<Adapter, TransportError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = Adapter::default().await.ok_or_else(|| {
            TransportError::AdapterUnavailable("default adapter not found".to_string())
        })?;
        adapter
            .wait_available()
            .await
            .map_err(|err| TransportError::AdapterUnavailable(err.to_string()))?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn characteristic(
        device: &Device,
        profile: &GattProfile,
        uuid: bluest::Uuid,
    ) -> Result<Characteristic, TransportError> {
        let service = device
            .discover_services_with_uuid(profile.service)
            .await
            .map_err(backend)?
            .first()
            .cloned()
            .ok_or(TransportError::ServiceMissing(profile.service))?;
        service
            .discover_characteristics_with_uuid(uuid)
            .await
            .map_err(backend)?
            .first()
            .cloned()
            .ok_or(TransportError::ServiceMissing(uuid))
    }

    fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Transport for BluestTransport {
    type Peripheral = Device;

    async fn scan(
        &mut self,
        window: Duration,
    ) -> Result<Vec<Advertisement<Device>>, TransportError> {
        let adapter = self.adapter().await?;
        // Daly modules do not reliably advertise their service, so scan unfiltered
        let mut events = adapter.scan(&[]).await.map_err(backend)?;
        let deadline = Instant::now() + window;
        let mut found: Vec<Advertisement<Device>> = Vec::new();
        while let Ok(Some(event)) = timeout_at(deadline, events.next()).await {
            let address = format!("{:?}", event.device.id());
            if found.iter().any(|ad| ad.address == address) {
                continue;
            }
            let name = match event.adv_data.local_name {
                Some(name) => Some(name),
                None => event.device.name_async().await.ok(),
            };
            log::trace!("BLE device {address} {name:?} RSSI {:?}", event.rssi);
            found.push(Advertisement {
                peripheral: event.device,
                address,
                name,
                rssi: event.rssi,
            });
        }
        Ok(found)
    }

    async fn connect(
        &mut self,
        peripheral: &Device,
        profile: &GattProfile,
    ) -> Result<(), TransportError> {
        let adapter = self.adapter().await?;
        // recorded first so a failed or cancelled connect still gets torn down
        self.device = Some(peripheral.clone());
        adapter.connect_device(peripheral).await.map_err(backend)?;

        self.notify = Some(Self::characteristic(peripheral, profile, profile.notify).await?);
        self.write = Some(Self::characteristic(peripheral, profile, profile.write).await?);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let characteristic = self.notify.clone().ok_or(TransportError::NotConnected)?;
        self.stop_forwarder();

        let (sender, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        self.forwarder = Some(tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(backend(err)));
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                match item {
                    Ok(data) => {
                        if sender.send(data).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("Notification error: {err}");
                        break;
                    }
                }
            }
            log::debug!("Notification stream ended");
        }));

        match ready_rx.await {
            Ok(Ok(())) => Ok(receiver),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::StreamClosed),
        }
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.write.as_ref().ok_or(TransportError::NotConnected)?;
        characteristic.write(frame).await.map_err(backend)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_forwarder();
        self.notify = None;
        self.write = None;
        match (self.device.take(), &self.adapter) {
            (Some(device), Some(adapter)) => {
                adapter.disconnect_device(&device).await.map_err(backend)
            }
            _ => Ok(()),
        }
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}
