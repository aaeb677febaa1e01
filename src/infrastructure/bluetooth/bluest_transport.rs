//! `Transport` over the `bluest` crate.
//!
//! Each request is started as a task on the runtime captured at
//! construction; its outcome comes back through the event sink.

use crate::domain::error::TransportError;
use crate::domain::models::{Characteristic, CharacteristicProperties, PeripheralId, Service};
use crate::infrastructure::bluetooth::transport::{EventSink, Transport, TransportEvent};
use anyhow::Context;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a live link is polled for loss.
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

type AttributeKey = (PeripheralId, Uuid, Uuid);

pub struct BluestTransport {
    adapter: Adapter,
    events: EventSink,
    runtime: Handle,
    devices: Arc<Mutex<HashMap<PeripheralId, Device>>>,
    attributes: Arc<Mutex<HashMap<AttributeKey, bluest::Characteristic>>>,
    scan: Mutex<Option<AbortHandle>>,
    links: Mutex<HashMap<PeripheralId, AbortHandle>>,
    notifiers: Mutex<HashMap<AttributeKey, AbortHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transport_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::new(e.to_string())
}

fn attribute_key(peripheral: &PeripheralId, characteristic: &Characteristic) -> AttributeKey {
    (peripheral.clone(), characteristic.service_uuid, characteristic.uuid)
}

impl BluestTransport {
    /// Opens the default adapter and waits for it to power on.
    pub async fn new(events: EventSink) -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .context("No Bluetooth adapter found")?;
        info!("Waiting for Bluetooth adapter");
        adapter.wait_available().await?;
        // Nobody listening yet is not an error
        let _ = events.send(TransportEvent::AdapterStateChanged { powered: true });

        Ok(Self {
            adapter,
            events,
            runtime: Handle::try_current().context("BluestTransport requires a Tokio runtime")?,
            devices: Arc::new(Mutex::new(HashMap::new())),
            attributes: Arc::new(Mutex::new(HashMap::new())),
            scan: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
        })
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<Device, TransportError> {
        lock(&self.devices)
            .get(peripheral)
            .cloned()
            .ok_or_else(|| TransportError::new(format!("{} has not been seen by a scan", peripheral)))
    }

    fn attribute(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<bluest::Characteristic, TransportError> {
        lock(&self.attributes)
            .get(&attribute_key(peripheral, characteristic))
            .cloned()
            .ok_or_else(|| TransportError::new(format!("{} not discovered", characteristic.uuid)))
    }

    fn emit(events: &EventSink, event: TransportEvent) {
        if events.send(event).is_err() {
            debug!("Event sink closed; dropping transport event");
        }
    }
}

impl Transport for BluestTransport {
    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let events = self.events.clone();
        let services = services.to_vec();

        let task = self.runtime.spawn(async move {
            let mut stream = match adapter.scan(&services).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    Self::emit(&events, TransportEvent::ScanFailed { error: transport_error(e) });
                    return;
                }
            };
            while let Some(found) = stream.next().await {
                let id = PeripheralId::new(found.device.id().to_string());
                let name = found
                    .adv_data
                    .local_name
                    .or_else(|| found.device.name().ok());
                debug!("Found device {} ({:?}) RSSI {:?}", id, name, found.rssi);
                lock(&devices).insert(id.clone(), found.device);
                Self::emit(
                    &events,
                    TransportEvent::Discovered {
                        peripheral: id,
                        name,
                        rssi: found.rssi.unwrap_or(i16::MIN),
                    },
                );
            }
            info!("Bluetooth scan stream has ended");
            Self::emit(
                &events,
                TransportEvent::ScanFailed {
                    error: TransportError::new("scan stream ended"),
                },
            );
        });

        if let Some(previous) = lock(&self.scan).replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(task) = lock(&self.scan).take() {
            task.abort();
        }
        Ok(())
    }

    fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = peripheral.clone();

        let task = self.runtime.spawn(async move {
            if let Err(e) = adapter.connect_device(&device).await {
                Self::emit(
                    &events,
                    TransportEvent::ConnectFailed {
                        peripheral: id,
                        error: transport_error(e),
                    },
                );
                return;
            }
            Self::emit(&events, TransportEvent::Connected { peripheral: id.clone() });

            // bluest has no link-loss callback; poll until the link drops
            loop {
                tokio::time::sleep(LINK_POLL_INTERVAL).await;
                if !device.is_connected().await {
                    Self::emit(
                        &events,
                        TransportEvent::Disconnected {
                            peripheral: id,
                            error: Some(TransportError::new("link lost")),
                        },
                    );
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.links).insert(peripheral.clone(), task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        if let Some(link) = lock(&self.links).remove(peripheral) {
            link.abort();
        }
        lock(&self.notifiers).retain(|(id, _, _), task| {
            if id == peripheral {
                task.abort();
            }
            id != peripheral
        });
        lock(&self.attributes).retain(|(id, _, _), _| id != peripheral);

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = peripheral.clone();
        self.runtime.spawn(async move {
            let error = adapter.disconnect_device(&device).await.err().map(transport_error);
            if let Some(e) = &error {
                warn!("Disconnecting {} reported: {}", id, e);
            }
            Self::emit(&events, TransportEvent::Disconnected { peripheral: id, error });
        });
        Ok(())
    }

    fn discover(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        let attributes = self.attributes.clone();
        let events = self.events.clone();
        let id = peripheral.clone();

        self.runtime.spawn(async move {
            match enumerate_device(&id, &device).await {
                Ok((services, characteristics, handles)) => {
                    lock(&attributes).extend(handles);
                    Self::emit(
                        &events,
                        TransportEvent::Enumerated {
                            peripheral: id,
                            services,
                            characteristics,
                        },
                    );
                }
                Err(error) => Self::emit(
                    &events,
                    TransportEvent::EnumerationFailed { peripheral: id, error },
                ),
            }
        });
        Ok(())
    }

    fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let key = attribute_key(peripheral, characteristic);
        if !enabled {
            if let Some(task) = lock(&self.notifiers).remove(&key) {
                // Dropping the stream turns notifications off
                task.abort();
            }
            Self::emit(
                &self.events,
                TransportEvent::NotifyStateChanged {
                    peripheral: peripheral.clone(),
                    characteristic: characteristic.uuid,
                    active: false,
                    error: None,
                },
            );
            return Ok(());
        }

        let handle = self.attribute(peripheral, characteristic)?;
        let events = self.events.clone();
        let id = peripheral.clone();
        let uuid = characteristic.uuid;

        let task = self.runtime.spawn(async move {
            let mut stream = match handle.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    Self::emit(
                        &events,
                        TransportEvent::NotifyStateChanged {
                            peripheral: id,
                            characteristic: uuid,
                            active: false,
                            error: Some(transport_error(e)),
                        },
                    );
                    return;
                }
            };
            Self::emit(
                &events,
                TransportEvent::NotifyStateChanged {
                    peripheral: id.clone(),
                    characteristic: uuid,
                    active: true,
                    error: None,
                },
            );
            while let Some(item) = stream.next().await {
                Self::emit(
                    &events,
                    TransportEvent::ValueUpdated {
                        peripheral: id.clone(),
                        characteristic: uuid,
                        value: item.map_err(transport_error),
                    },
                );
            }
            debug!("Notification stream for {} on {} ended", uuid, id);
        });

        if let Some(previous) = lock(&self.notifiers).insert(key, task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn read_value(&self, peripheral: &PeripheralId, characteristic: &Characteristic) -> Result<(), TransportError> {
        let handle = self.attribute(peripheral, characteristic)?;
        let events = self.events.clone();
        let id = peripheral.clone();
        let uuid = characteristic.uuid;

        self.runtime.spawn(async move {
            let value = handle.read().await.map_err(transport_error);
            Self::emit(
                &events,
                TransportEvent::ValueUpdated {
                    peripheral: id,
                    characteristic: uuid,
                    value,
                },
            );
        });
        Ok(())
    }

    fn write_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let handle = self.attribute(peripheral, characteristic)?;
        let events = self.events.clone();
        let id = peripheral.clone();
        let uuid = characteristic.uuid;
        let data = data.to_vec();

        self.runtime.spawn(async move {
            if with_response {
                let error = handle.write(&data).await.err().map(transport_error);
                Self::emit(
                    &events,
                    TransportEvent::WriteAcknowledged {
                        peripheral: id,
                        characteristic: uuid,
                        error,
                    },
                );
            } else if let Err(e) = handle.write_without_response(&data).await {
                warn!("Write without response to {} on {} failed: {}", uuid, id, e);
            }
        });
        Ok(())
    }
}

type Enumeration = (
    Vec<Service>,
    Vec<Characteristic>,
    Vec<(AttributeKey, bluest::Characteristic)>,
);

async fn enumerate_device(id: &PeripheralId, device: &Device) -> Result<Enumeration, TransportError> {
    let mut services = Vec::new();
    let mut characteristics = Vec::new();
    let mut handles = Vec::new();

    for service in device.discover_services().await.map_err(transport_error)? {
        let service_uuid = service.uuid();
        services.push(Service {
            uuid: service_uuid,
            is_primary: service.is_primary().await.unwrap_or(true),
        });

        for handle in service.discover_characteristics().await.map_err(transport_error)? {
            let props = handle.properties().await.map_err(transport_error)?;
            let characteristic = Characteristic {
                uuid: handle.uuid(),
                service_uuid,
                properties: CharacteristicProperties {
                    read: props.read,
                    write: props.write,
                    write_without_response: props.write_without_response,
                    notify: props.notify,
                    indicate: props.indicate,
                },
            };
            handles.push((attribute_key(id, &characteristic), handle));
            characteristics.push(characteristic);
        }
    }
    Ok((services, characteristics, handles))
}
