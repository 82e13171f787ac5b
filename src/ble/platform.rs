//! Host stack backed by btleplug
//!
//! Maps btleplug's request/response API onto the fire-and-forget command model:
//! every command runs on a spawned task and reports back through the host event
//! channel. btleplug discovers services and characteristics in one pass, so
//! characteristic discovery is answered from its cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::adapter::{
    AdapterState, Advertisement, BleError, ConnectOptions, HostEvent, HostEventReceiver,
    HostEventSender, HostStack, Peer, PeerId, PeripheralSighting, ScanRequest,
    host_event_channel,
};

/// [`HostStack`] over the first adapter btleplug reports
pub struct BtleplugHost {
    adapter: Adapter,
    events: HostEventSender,
    runtime: Handle,
    peripherals: Arc<RwLock<HashMap<PeerId, Peripheral>>>,
    notification_pumps: Arc<Mutex<HashMap<PeerId, JoinHandle<()>>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugHost {
    /// Open the default adapter and start forwarding its events.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn new() -> Result<(Arc<Self>, HostEventReceiver), BleError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterUnavailable {
                reason: AdapterState::Unsupported,
            })?;
        if let Ok(info) = adapter.adapter_info().await {
            tracing::info!("📡 Using BLE adapter {}", info);
        }

        let (events, receiver) = host_event_channel();
        let host = Arc::new(Self {
            adapter,
            events,
            runtime: Handle::current(),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            notification_pumps: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
        });

        let central_events = host.adapter.events().await?;
        let listener = host.runtime.spawn(listen(
            host.adapter.clone(),
            central_events,
            host.events.clone(),
            host.peripherals.clone(),
        ));
        *host.listener.lock() = Some(listener);

        let initial = match host.adapter.adapter_state().await {
            Ok(state) => adapter_state(state),
            Err(e) => {
                tracing::warn!("⚠️ Could not read adapter state: {}", e);
                AdapterState::Unknown
            }
        };
        let _ = host.events.send(HostEvent::AdapterStateChanged(initial));

        Ok((host, receiver))
    }

    fn peripheral(&self, peer: &PeerId) -> Option<Peripheral> {
        self.peripherals.read().get(peer).cloned()
    }

    fn emit(&self, event: HostEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Host event dropped: central manager is gone");
        }
    }

    fn start_notification_pump(&self, peer: &PeerId, peripheral: Peripheral) {
        let pump =
            spawn_notification_pump(&self.runtime, self.events.clone(), peer.clone(), peripheral);
        if let Some(previous) = self.notification_pumps.lock().insert(peer.clone(), pump) {
            previous.abort();
        }
    }

    fn stop_notification_pump(&self, peer: &PeerId) {
        if let Some(pump) = self.notification_pumps.lock().remove(peer) {
            pump.abort();
        }
    }

    fn unknown_peer(&self, peer: &PeerId) -> String {
        BleError::PeripheralNotFound { id: peer.clone() }.to_string()
    }
}

impl Drop for BtleplugHost {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        for (_, pump) in self.notification_pumps.lock().drain() {
            pump.abort();
        }
    }
}

#[async_trait]
impl HostStack for BtleplugHost {
    fn start_scan(&self, request: &ScanRequest) {
        let adapter = self.adapter.clone();
        let filter = BtleScanFilter {
            services: request.services.clone(),
        };
        self.runtime.spawn(async move {
            match adapter.start_scan(filter).await {
                Ok(()) => tracing::info!("🔍 BLE scan started"),
                Err(e) => tracing::error!("❌ Failed to start scan: {}", e),
            }
        });
    }

    fn stop_scan(&self) {
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                tracing::warn!("⚠️ Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(&self, peer: &PeerId, _options: ConnectOptions) {
        let Some(peripheral) = self.peripheral(peer) else {
            self.emit(HostEvent::ConnectFailed {
                peer: peer.clone(),
                error: self.unknown_peer(peer),
            });
            return;
        };

        let events = self.events.clone();
        let pumps = self.notification_pumps.clone();
        let runtime = self.runtime.clone();
        let id = peer.clone();
        self.runtime.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    let pump =
                        spawn_notification_pump(&runtime, events.clone(), id.clone(), peripheral);
                    if let Some(previous) = pumps.lock().insert(id.clone(), pump) {
                        previous.abort();
                    }
                    let _ = events.send(HostEvent::Connected { peer: id });
                }
                Err(e) => {
                    let _ = events.send(HostEvent::ConnectFailed {
                        peer: id,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    fn cancel_connection(&self, peer: &PeerId) {
        self.stop_notification_pump(peer);
        let Some(peripheral) = self.peripheral(peer) else {
            self.emit(HostEvent::Disconnected {
                peer: peer.clone(),
                error: None,
            });
            return;
        };

        let events = self.events.clone();
        let id = peer.clone();
        self.runtime.spawn(async move {
            let was_connected = peripheral.is_connected().await.unwrap_or(false);
            match peripheral.disconnect().await {
                // A live link reports its own DeviceDisconnected event
                Ok(()) if was_connected => {}
                Ok(()) => {
                    let _ = events.send(HostEvent::Disconnected {
                        peer: id,
                        error: None,
                    });
                }
                Err(e) => {
                    let _ = events.send(HostEvent::Disconnected {
                        peer: id,
                        error: Some(e.to_string()),
                    });
                }
            }
        });
    }

    fn discover_services(&self, peer: &PeerId) {
        let Some(peripheral) = self.peripheral(peer) else {
            self.emit(HostEvent::ServicesDiscovered {
                peer: peer.clone(),
                services: Vec::new(),
                error: Some(self.unknown_peer(peer)),
            });
            return;
        };

        let events = self.events.clone();
        let id = peer.clone();
        self.runtime.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => HostEvent::ServicesDiscovered {
                    peer: id,
                    services: peripheral.services().iter().map(|s| s.uuid).collect(),
                    error: None,
                },
                Err(e) => HostEvent::ServicesDiscovered {
                    peer: id,
                    services: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            let _ = events.send(event);
        });
    }

    fn discover_characteristics(&self, peer: &PeerId, service: Uuid) {
        let event = match self.peripheral(peer) {
            Some(peripheral) => {
                let characteristics = peripheral
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service)
                    .map(|s| s.characteristics.iter().map(|c| c.uuid).collect());
                match characteristics {
                    Some(characteristics) => HostEvent::CharacteristicsDiscovered {
                        peer: peer.clone(),
                        service,
                        characteristics,
                        error: None,
                    },
                    None => HostEvent::CharacteristicsDiscovered {
                        peer: peer.clone(),
                        service,
                        characteristics: Vec::new(),
                        error: Some(format!("service {} not discovered", service)),
                    },
                }
            }
            None => HostEvent::CharacteristicsDiscovered {
                peer: peer.clone(),
                service,
                characteristics: Vec::new(),
                error: Some(self.unknown_peer(peer)),
            },
        };
        self.emit(event);
    }

    fn read_value(&self, peer: &PeerId, characteristic: Uuid) {
        let target = self.characteristic(peer, characteristic);
        let events = self.events.clone();
        let id = peer.clone();
        self.runtime.spawn(async move {
            let (value, error) = match target {
                Ok((peripheral, ch)) => match peripheral.read(&ch).await {
                    Ok(value) => (Some(value), None),
                    Err(e) => (None, Some(e.to_string())),
                },
                Err(e) => (None, Some(e)),
            };
            let _ = events.send(HostEvent::ValueUpdated {
                peer: id,
                characteristic,
                value,
                error,
            });
        });
    }

    fn write_value(&self, peer: &PeerId, characteristic: Uuid, data: &[u8], with_response: bool) {
        let target = self.characteristic(peer, characteristic);
        let events = self.events.clone();
        let id = peer.clone();
        let data = data.to_vec();
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.runtime.spawn(async move {
            let error = match target {
                Ok((peripheral, ch)) => peripheral
                    .write(&ch, &data, write_type)
                    .await
                    .err()
                    .map(|e| e.to_string()),
                Err(e) => Some(e),
            };
            if with_response {
                let _ = events.send(HostEvent::ValueWritten {
                    peer: id,
                    characteristic,
                    value: None,
                    error,
                });
            }
        });
    }

    fn set_notify_value(&self, peer: &PeerId, characteristic: Uuid, enabled: bool) {
        let target = self.characteristic(peer, characteristic);
        if enabled && !self.notification_pumps.lock().contains_key(peer) {
            if let Some(peripheral) = self.peripheral(peer) {
                self.start_notification_pump(peer, peripheral);
            }
        }

        let events = self.events.clone();
        let id = peer.clone();
        self.runtime.spawn(async move {
            let error = match target {
                Ok((peripheral, ch)) => {
                    let result = if enabled {
                        peripheral.subscribe(&ch).await
                    } else {
                        peripheral.unsubscribe(&ch).await
                    };
                    result.err().map(|e| e.to_string())
                }
                Err(e) => Some(e),
            };
            let _ = events.send(HostEvent::NotifyStateChanged {
                peer: id,
                characteristic,
                enabled,
                error,
            });
        });
    }

    async fn retrieve_peers(&self, ids: &[PeerId]) -> Result<Vec<Peer>, BleError> {
        let mut peers = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let id = peer_id(&peripheral.id());
            if !ids.contains(&id) {
                continue;
            }
            let name = peripheral
                .properties()
                .await?
                .and_then(|properties| properties.local_name);
            self.peripherals.write().insert(id.clone(), peripheral);
            peers.push(Peer::new(id, name));
        }
        Ok(peers)
    }
}

impl BtleplugHost {
    fn characteristic(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic), String> {
        let peripheral = self.peripheral(peer).ok_or_else(|| self.unknown_peer(peer))?;
        let ch = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| BleError::CharacteristicNotFound { id: characteristic }.to_string())?;
        Ok((peripheral, ch))
    }
}

/// Forward value notifications of a connected peer until its stream ends
fn spawn_notification_pump(
    runtime: &Handle,
    events: HostEventSender,
    peer: PeerId,
    peripheral: Peripheral,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("⚠️ No notification stream for {}: {}", peer, e);
                return;
            }
        };
        while let Some(notification) = notifications.next().await {
            let event = HostEvent::ValueUpdated {
                peer: peer.clone(),
                characteristic: notification.uuid,
                value: Some(notification.value),
                error: None,
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

fn peer_id(id: &PeripheralId) -> PeerId {
    PeerId::new(id.to_string())
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        #[allow(unreachable_patterns)]
        _ => AdapterState::Unknown,
    }
}

/// Translate adapter events until the adapter stream ends
async fn listen(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: HostEventSender,
    peripherals: Arc<RwLock<HashMap<PeerId, Peripheral>>>,
) {
    while let Some(event) = central_events.next().await {
        let host_event = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let peer_id = peer_id(&id);
                peripherals.write().insert(peer_id.clone(), peripheral);
                HostEvent::PeripheralSighted(PeripheralSighting {
                    peer: Peer::new(peer_id, properties.local_name.clone()),
                    advertisement: Advertisement {
                        local_name: properties.local_name,
                        services: properties.services,
                        manufacturer_data: properties.manufacturer_data,
                        service_data: properties.service_data,
                    },
                    rssi: properties.rssi.unwrap_or(0),
                })
            }
            CentralEvent::DeviceDisconnected(id) => {
                tracing::debug!("Peripheral {:?} disconnected", id);
                HostEvent::Disconnected {
                    peer: peer_id(&id),
                    error: None,
                }
            }
            CentralEvent::StateUpdate(state) => HostEvent::AdapterStateChanged(adapter_state(state)),
            _ => continue,
        };
        if events.send(host_event).is_err() {
            break;
        }
    }
    tracing::debug!("Adapter event stream ended");
}
