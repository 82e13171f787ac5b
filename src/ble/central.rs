//! Central manager: brokers, device registry and host event routing
//!
//! Owns everything shared between devices of one host adapter and runs the
//! event pump that turns host callbacks into broker and device updates.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::adapter::{
    AdapterState, Advertisement, BleError, HostEvent, HostEventReceiver, HostStack, Peer, PeerId,
};
use super::connection::ConnectionBroker;
use super::device::{BleDevice, DeviceContext, DeviceStateEvent};
use super::handshake::{DefaultProfile, DeviceProfile};
use super::registry::DeviceRegistry;
use super::scan::{ScanBroker, ScanFilter};
use super::status::CentralStatusGate;
use crate::config::{BleConfig, ConfigError, GatePolicy};
use crate::queue::OperationSerializer;

/// A scan result resolved to its registered device
#[derive(Debug, Clone)]
pub struct DeviceSighting {
    pub device: BleDevice,
    pub advertisement: Advertisement,
    /// Signal strength in dBm
    pub rssi: i16,
}

struct CentralInner {
    host: Arc<dyn HostStack>,
    config: Arc<BleConfig>,
    gate: Arc<CentralStatusGate>,
    connections: Arc<ConnectionBroker>,
    scanner: Arc<ScanBroker>,
    registry: DeviceRegistry,
    /// Shared by every device under `GatePolicy::Global`
    serializer: Arc<OperationSerializer>,
    profile: Arc<dyn DeviceProfile>,
    state_events: broadcast::Sender<DeviceStateEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Coordinates scans, connections and devices for one host adapter
#[derive(Clone)]
pub struct CentralManager {
    inner: Arc<CentralInner>,
}

impl CentralManager {
    /// Create a manager over `host`, consuming its event channel.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        host: Arc<dyn HostStack>,
        events: HostEventReceiver,
        config: BleConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_profile(host, events, config, Arc::new(DefaultProfile))
    }

    /// Create a manager that builds devices through `profile`
    pub fn with_profile(
        host: Arc<dyn HostStack>,
        events: HostEventReceiver,
        config: BleConfig,
        profile: Arc<dyn DeviceProfile>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let gate = Arc::new(CentralStatusGate::new());
        let connections = Arc::new(ConnectionBroker::new(
            host.clone(),
            gate.clone(),
            config.disconnect_timeout(),
        ));
        let scanner = Arc::new(ScanBroker::new(host.clone(), gate.clone(), config.scan_buffer));
        let (state_events, _) = broadcast::channel(config.state_buffer);

        let inner = Arc::new(CentralInner {
            host,
            config,
            gate,
            connections,
            scanner,
            registry: DeviceRegistry::new(),
            serializer: OperationSerializer::new("global"),
            profile,
            state_events,
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&inner), events));
        *inner.pump.lock() = Some(pump);
        tracing::info!("🚀 BLE central manager started");

        Ok(Self { inner })
    }

    /// Latest adapter state, `None` until the host reports one
    pub fn adapter_state(&self) -> Option<AdapterState> {
        self.inner.gate.current()
    }

    /// Wait for the first adapter report and require it to be usable
    pub async fn wait_ready(&self) -> Result<(), BleError> {
        self.inner.gate.wait_ready().await
    }

    pub fn config(&self) -> &BleConfig {
        &self.inner.config
    }

    /// Scan for devices. Sightings of peers the profile rejects are dropped.
    pub fn scan(&self, filter: ScanFilter) -> BoxStream<'static, Result<DeviceSighting, BleError>> {
        let inner = self.inner.clone();
        self.inner
            .scanner
            .scan(filter)
            .filter_map(move |result| {
                let sighting = match result {
                    Ok(sighting) => inner.device_for(&sighting.peer).map(|device| {
                        Ok(DeviceSighting {
                            device,
                            advertisement: sighting.advertisement,
                            rssi: sighting.rssi,
                        })
                    }),
                    Err(e) => Some(Err(e)),
                };
                future::ready(sighting)
            })
            .boxed()
    }

    /// Scan and emit the growing list of distinct devices seen so far
    pub fn scan_devices(
        &self,
        filter: ScanFilter,
    ) -> BoxStream<'static, Result<Vec<BleDevice>, BleError>> {
        self.scan(filter)
            .scan(Vec::<BleDevice>::new(), |seen, result| {
                let update = match result {
                    Ok(sighting) if seen.contains(&sighting.device) => None,
                    Ok(sighting) => {
                        seen.push(sighting.device);
                        Some(Ok(seen.clone()))
                    }
                    Err(e) => Some(Err(e)),
                };
                future::ready(Some(update))
            })
            .filter_map(future::ready)
            .boxed()
    }

    /// Like [`scan_devices`](Self::scan_devices), ending after `duration`
    pub fn scan_devices_for(
        &self,
        filter: ScanFilter,
        duration: Duration,
    ) -> BoxStream<'static, Result<Vec<BleDevice>, BleError>> {
        self.scan_devices(filter)
            .take_until(tokio::time::sleep(duration))
            .boxed()
    }

    /// Resolve peers the host already knows by identifier. Unknown identifiers
    /// and peers the profile rejects are skipped.
    pub async fn retrieve_devices(&self, ids: &[PeerId]) -> Result<Vec<BleDevice>, BleError> {
        self.inner.gate.wait_ready().await?;
        let peers = self.inner.host.retrieve_peers(ids).await?;
        Ok(peers
            .iter()
            .filter_map(|peer| self.inner.device_for(peer))
            .collect())
    }

    pub fn device(&self, id: &PeerId) -> Option<BleDevice> {
        self.inner.registry.get(id)
    }

    pub fn devices(&self) -> Vec<BleDevice> {
        self.inner.registry.all()
    }

    pub fn connected_devices(&self) -> Vec<BleDevice> {
        self.inner.registry.connected()
    }

    /// Forget a device. Its connection, if any, is left alone.
    pub fn remove_device(&self, id: &PeerId) -> Option<BleDevice> {
        self.inner.registry.remove(id)
    }

    /// Every visible state change of every device, in order
    pub fn connection_events(&self) -> BoxStream<'static, DeviceStateEvent> {
        BroadcastStream::new(self.inner.state_events.subscribe())
            .filter_map(|event| {
                future::ready(match event {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!("Connection event listener lagged by {}", skipped);
                        None
                    }
                })
            })
            .boxed()
    }
}

impl CentralInner {
    /// Registered device for a peer, created on first sight if the profile
    /// accepts it
    fn device_for(&self, peer: &Peer) -> Option<BleDevice> {
        self.registry.get_or_insert_with(&peer.id, || {
            if !self.profile.accepts(peer) {
                return None;
            }
            let serializer = match self.config.gate_policy {
                GatePolicy::Global => self.serializer.clone(),
                GatePolicy::PerDevice => OperationSerializer::new(peer.id.to_string()),
            };
            let ctx = DeviceContext {
                host: self.host.clone(),
                broker: self.connections.clone(),
                config: self.config.clone(),
                events: self.state_events.clone(),
            };
            Some(BleDevice::new(
                peer.clone(),
                ctx,
                serializer,
                self.profile.handshake(peer),
            ))
        })
    }

    fn dispatch(&self, event: HostEvent) {
        match event {
            HostEvent::AdapterStateChanged(state) => {
                self.gate.update(state);
                if state != AdapterState::PoweredOn {
                    let error = BleError::AdapterUnavailable { reason: state };
                    self.scanner.abort(error.clone());
                    self.connections.fail_all(error);
                    for device in self.registry.all() {
                        device.handle_link_lost(BleError::Disconnected);
                    }
                }
            }
            HostEvent::PeripheralSighted(sighting) => self.scanner.publish(sighting),
            HostEvent::Connected { peer } => {
                self.connections.on_connected(&peer);
            }
            HostEvent::ConnectFailed { peer, error } => {
                self.connections.on_connect_failed(&peer, error);
            }
            HostEvent::Disconnected { peer, error } => {
                let requested = self.connections.on_disconnected(&peer, error.as_deref());
                if !requested {
                    if let Some(device) = self.registry.get(&peer) {
                        device.handle_link_lost(BleError::Disconnected);
                    }
                }
            }
            HostEvent::ServicesDiscovered {
                peer,
                services,
                error,
            } => {
                if let Some(device) = self.known(&peer) {
                    device.on_services_discovered(services, error);
                }
            }
            HostEvent::CharacteristicsDiscovered {
                peer,
                service,
                characteristics,
                error,
            } => {
                if let Some(device) = self.known(&peer) {
                    device.on_characteristics_discovered(service, characteristics, error);
                }
            }
            HostEvent::ValueUpdated {
                peer,
                characteristic,
                value,
                error,
            } => {
                if let Some(device) = self.known(&peer) {
                    device.on_value_updated(characteristic, value, error);
                }
            }
            HostEvent::ValueWritten {
                peer,
                characteristic,
                value,
                error,
            } => {
                if let Some(device) = self.known(&peer) {
                    device.on_value_written(characteristic, value, error);
                }
            }
            HostEvent::NotifyStateChanged {
                peer,
                characteristic,
                enabled,
                error,
            } => {
                if let Some(device) = self.known(&peer) {
                    device.on_notify_state_changed(characteristic, enabled, error);
                }
            }
        }
    }

    fn known(&self, peer: &PeerId) -> Option<BleDevice> {
        let device = self.registry.get(peer);
        if device.is_none() {
            tracing::debug!("Ignoring host callback for unknown peer {}", peer);
        }
        device
    }
}

impl Drop for CentralInner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn run_event_pump(central: Weak<CentralInner>, mut events: HostEventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(central) = central.upgrade() else {
            break;
        };
        central.dispatch(event);
    }
    tracing::debug!("Host event pump stopped");
}
