use std::sync::Mutex;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Address, Device, DeviceEvent, DeviceProperty};
use futures::{pin_mut, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BleLink, GattUuids, LinkError, LinkEvent, LinkEventSender};

/// Resolved endpoints of the QXW service.
#[derive(Clone)]
struct Endpoints {
    write: Characteristic,
    notify: Characteristic,
}

/// BLE GATT link to a peripheral through BlueZ.
pub struct GattLink {
    device: Device,
    events: Mutex<Option<LinkEventSender>>,
    endpoints: Mutex<Option<Endpoints>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    notify_task: Mutex<Option<JoinHandle<()>>>,
}

impl GattLink {
    /// Open the default adapter and look up `address`. Does not connect.
    pub async fn new(address: Address) -> Result<Self, LinkError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        let device = adapter.device(address)?;

        Ok(Self {
            device,
            events: Mutex::new(None),
            endpoints: Mutex::new(None),
            watch_task: Mutex::new(None),
            notify_task: Mutex::new(None),
        })
    }

    pub fn address(&self) -> Address {
        self.device.address()
    }

    fn endpoints(&self) -> Result<Endpoints, LinkError> {
        lock(&self.endpoints).clone().ok_or(LinkError::NotConnected)
    }

    fn event_sender(&self) -> Result<LinkEventSender, LinkError> {
        lock(&self.events).clone().ok_or(LinkError::NotConnected)
    }

    fn abort_tasks(&self) {
        for slot in [&self.notify_task, &self.watch_task] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BleLink for GattLink {
    async fn connect(&self, events: LinkEventSender) -> Result<(), LinkError> {
        info!("Connecting to {} via BLE", self.device.address());
        *lock(&self.events) = Some(events.clone());

        if !self.device.is_connected().await? {
            self.device.connect().await?;
        }

        // Watch for the peripheral dropping the connection.
        let device = self.device.clone();
        let task = tokio::spawn(async move {
            let stream = match device.events().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("Cannot watch device events: {}", e);
                    return;
                }
            };
            pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    info!("{} dropped the connection", device.address());
                    let _ = events.send(LinkEvent::Disconnected).await;
                    return;
                }
            }
        });
        *lock(&self.watch_task) = Some(task);

        info!("Connected to {}", self.device.address());
        Ok(())
    }

    async fn discover(&self, uuids: GattUuids) -> Result<(), LinkError> {
        for service in self.device.services().await? {
            let service_uuid = service.uuid().await?;
            debug!("Service: {}", service_uuid);
            if service_uuid != uuids.service {
                continue;
            }

            let mut write = None;
            let mut notify = None;
            for ch in service.characteristics().await? {
                let uuid = ch.uuid().await?;
                debug!("  Characteristic: {}", uuid);
                if uuid == uuids.write {
                    write = Some(ch);
                } else if uuid == uuids.notify {
                    notify = Some(ch);
                }
            }

            let write = write.ok_or(LinkError::CharacteristicMissing(uuids.write))?;
            let notify = notify.ok_or(LinkError::CharacteristicMissing(uuids.notify))?;
            *lock(&self.endpoints) = Some(Endpoints { write, notify });
            return Ok(());
        }

        Err(LinkError::ServiceMissing(uuids.service))
    }

    async fn subscribe(&self) -> Result<(), LinkError> {
        let notify = self.endpoints()?.notify;
        let events = self.event_sender()?;
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let stream = match notify.notify().await {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(LinkError::from(e)));
                    return;
                }
            };
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                if events.send(LinkEvent::Notification(value)).await.is_err() {
                    debug!("Notification receiver closed");
                    return;
                }
            }
            debug!("Notification stream ended");
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                *lock(&self.notify_task) = Some(task);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LinkError::Transport("notify task exited".into())),
        }
    }

    async fn unsubscribe(&self) -> Result<(), LinkError> {
        // Dropping the notify stream stops notifications in BlueZ.
        match lock(&self.notify_task).take() {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(LinkError::NotConnected),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        let write = self.endpoints()?.write;
        let req = CharacteristicWriteRequest {
            op_type: WriteOp::Command,
            ..Default::default()
        };
        write.write_ext(data, &req).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.abort_tasks();
        *lock(&self.endpoints) = None;
        *lock(&self.events) = None;
        if self.device.is_connected().await? {
            self.device.disconnect().await?;
        }
        info!("Disconnected from {}", self.device.address());
        Ok(())
    }
}

impl Drop for GattLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
