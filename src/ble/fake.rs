//! In-memory host stack for tests and demos
//!
//! `FakeHost` records every command it receives and answers through the same
//! event channel a real backend uses. How each command category is answered
//! is scripted with [`Behavior`]; callbacks can also be injected by hand.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use super::adapter::{
    host_event_channel, AdapterState, Advertisement, BleError, ConnectOptions, HostEvent,
    HostEventReceiver, HostEventSender, HostStack, Peer, PeerId, PeripheralSighting, ScanRequest,
};

/// A command received by [`FakeHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    StartScan(ScanRequest),
    StopScan,
    Connect {
        peer: PeerId,
        options: ConnectOptions,
    },
    CancelConnection(PeerId),
    DiscoverServices(PeerId),
    DiscoverCharacteristics {
        peer: PeerId,
        service: Uuid,
    },
    ReadValue {
        peer: PeerId,
        characteristic: Uuid,
    },
    WriteValue {
        peer: PeerId,
        characteristic: Uuid,
        data: Vec<u8>,
        with_response: bool,
    },
    SetNotifyValue {
        peer: PeerId,
        characteristic: Uuid,
        enabled: bool,
    },
    RetrievePeers(Vec<PeerId>),
}

/// How a command category is answered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Reply {
    /// Answer immediately with success
    #[default]
    Respond,
    /// Answer immediately with the given host error
    Fail(String),
    /// Record the call and never answer
    Silent,
}

/// Reply script, one entry per command category
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub connect: Reply,
    pub disconnect: Reply,
    pub discovery: Reply,
    pub read: Reply,
    pub write: Reply,
    pub notify: Reply,
}

/// A simulated remote peripheral
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    pub peer: Peer,
    /// Services and their characteristics
    pub services: Vec<(Uuid, Vec<Uuid>)>,
    /// Current characteristic values returned by reads
    pub values: HashMap<Uuid, Vec<u8>>,
}

impl FakePeripheral {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            peer: Peer::new(id, name.map(str::to_string)),
            services: Vec::new(),
            values: HashMap::new(),
        }
    }

    pub fn with_service(mut self, service: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.push((service, characteristics.to_vec()));
        self
    }

    pub fn with_value(mut self, characteristic: Uuid, value: &[u8]) -> Self {
        self.values.insert(characteristic, value.to_vec());
        self
    }

    fn characteristics(&self, service: Uuid) -> Vec<Uuid> {
        self.services
            .iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, characteristics)| characteristics.clone())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct FakeState {
    behavior: Behavior,
    peripherals: HashMap<PeerId, FakePeripheral>,
    calls: Vec<HostCall>,
    echo_writes: bool,
}

/// Scriptable [`HostStack`] test double
pub struct FakeHost {
    events: HostEventSender,
    state: Mutex<FakeState>,
    recorded: watch::Sender<usize>,
}

impl FakeHost {
    /// Create a fake host and the event receiver to hand to the central manager
    pub fn new() -> (Arc<Self>, HostEventReceiver) {
        let (events, receiver) = host_event_channel();
        let (recorded, _) = watch::channel(0);
        let host = Arc::new(Self {
            events,
            state: Mutex::new(FakeState::default()),
            recorded,
        });
        (host, receiver)
    }

    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        self.state
            .lock()
            .peripherals
            .insert(peripheral.peer.id.clone(), peripheral);
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().behavior = behavior;
    }

    pub fn update_behavior(&self, update: impl FnOnce(&mut Behavior)) {
        update(&mut self.state.lock().behavior);
    }

    /// Answer acknowledged writes with the written payload instead of no value
    pub fn set_echo_writes(&self, echo: bool) {
        self.state.lock().echo_writes = echo;
    }

    /// Inject an arbitrary host callback
    pub fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.emit(HostEvent::AdapterStateChanged(state));
    }

    /// Report an advertisement from a known peripheral
    pub fn advertise(&self, id: &str, advertisement: Advertisement, rssi: i16) {
        let peer = self
            .state
            .lock()
            .peripherals
            .get(&PeerId::from(id))
            .map(|p| p.peer.clone())
            .unwrap_or_else(|| Peer::new(id, advertisement.local_name.clone()));
        self.emit(HostEvent::PeripheralSighted(PeripheralSighting {
            peer,
            advertisement,
            rssi,
        }));
    }

    /// Deliver a value update for a characteristic
    pub fn notify(&self, id: &str, characteristic: Uuid, value: &[u8]) {
        self.emit(HostEvent::ValueUpdated {
            peer: PeerId::from(id),
            characteristic,
            value: Some(value.to_vec()),
            error: None,
        });
    }

    /// Acknowledge a write, optionally echoing a payload
    pub fn acknowledge_write(&self, id: &str, characteristic: Uuid, value: Option<&[u8]>) {
        self.emit(HostEvent::ValueWritten {
            peer: PeerId::from(id),
            characteristic,
            value: value.map(<[u8]>::to_vec),
            error: None,
        });
    }

    /// Drop the link from the peripheral side
    pub fn drop_link(&self, id: &str) {
        self.emit(HostEvent::Disconnected {
            peer: PeerId::from(id),
            error: Some("connection lost".to_string()),
        });
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&HostCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(*c)).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Wait until at least `n` recorded calls match the predicate
    pub async fn wait_for_calls(&self, predicate: impl Fn(&HostCall) -> bool, n: usize) {
        let mut recorded = self.recorded.subscribe();
        loop {
            if self.count(&predicate) >= n {
                return;
            }
            if recorded.changed().await.is_err() {
                return;
            }
        }
    }

    fn record(&self, call: HostCall) -> (Behavior, Option<FakePeripheral>, bool) {
        let answer = {
            let mut state = self.state.lock();
            let peripheral = call_peer(&call).and_then(|id| state.peripherals.get(id).cloned());
            state.calls.push(call);
            (state.behavior.clone(), peripheral, state.echo_writes)
        };
        self.recorded.send_modify(|n| *n += 1);
        answer
    }
}

fn call_peer(call: &HostCall) -> Option<&PeerId> {
    match call {
        HostCall::StartScan(_) | HostCall::StopScan | HostCall::RetrievePeers(_) => None,
        HostCall::Connect { peer, .. }
        | HostCall::CancelConnection(peer)
        | HostCall::DiscoverServices(peer)
        | HostCall::DiscoverCharacteristics { peer, .. }
        | HostCall::ReadValue { peer, .. }
        | HostCall::WriteValue { peer, .. }
        | HostCall::SetNotifyValue { peer, .. } => Some(peer),
    }
}

fn failure(reply: &Reply) -> Option<String> {
    match reply {
        Reply::Fail(cause) => Some(cause.clone()),
        _ => None,
    }
}

#[async_trait]
impl HostStack for FakeHost {
    fn start_scan(&self, request: &ScanRequest) {
        self.record(HostCall::StartScan(request.clone()));
    }

    fn stop_scan(&self) {
        self.record(HostCall::StopScan);
    }

    fn connect(&self, peer: &PeerId, options: ConnectOptions) {
        let (behavior, _, _) = self.record(HostCall::Connect {
            peer: peer.clone(),
            options,
        });
        match behavior.connect {
            Reply::Respond => self.emit(HostEvent::Connected { peer: peer.clone() }),
            Reply::Fail(error) => self.emit(HostEvent::ConnectFailed {
                peer: peer.clone(),
                error,
            }),
            Reply::Silent => {}
        }
    }

    fn cancel_connection(&self, peer: &PeerId) {
        let (behavior, _, _) = self.record(HostCall::CancelConnection(peer.clone()));
        if behavior.disconnect != Reply::Silent {
            self.emit(HostEvent::Disconnected {
                peer: peer.clone(),
                error: failure(&behavior.disconnect),
            });
        }
    }

    fn discover_services(&self, peer: &PeerId) {
        let (behavior, peripheral, _) = self.record(HostCall::DiscoverServices(peer.clone()));
        if behavior.discovery == Reply::Silent {
            return;
        }
        let error = failure(&behavior.discovery);
        let services = match (&error, peripheral) {
            (None, Some(peripheral)) => peripheral.services.iter().map(|(s, _)| *s).collect(),
            _ => Vec::new(),
        };
        self.emit(HostEvent::ServicesDiscovered {
            peer: peer.clone(),
            services,
            error,
        });
    }

    fn discover_characteristics(&self, peer: &PeerId, service: Uuid) {
        let (behavior, peripheral, _) = self.record(HostCall::DiscoverCharacteristics {
            peer: peer.clone(),
            service,
        });
        if behavior.discovery == Reply::Silent {
            return;
        }
        let error = failure(&behavior.discovery);
        let characteristics = match (&error, peripheral) {
            (None, Some(peripheral)) => peripheral.characteristics(service),
            _ => Vec::new(),
        };
        self.emit(HostEvent::CharacteristicsDiscovered {
            peer: peer.clone(),
            service,
            characteristics,
            error,
        });
    }

    fn read_value(&self, peer: &PeerId, characteristic: Uuid) {
        let (behavior, peripheral, _) = self.record(HostCall::ReadValue {
            peer: peer.clone(),
            characteristic,
        });
        let (value, error) = match behavior.read {
            Reply::Silent => return,
            Reply::Fail(error) => (None, Some(error)),
            Reply::Respond => (
                Some(
                    peripheral
                        .and_then(|p| p.values.get(&characteristic).cloned())
                        .unwrap_or_default(),
                ),
                None,
            ),
        };
        self.emit(HostEvent::ValueUpdated {
            peer: peer.clone(),
            characteristic,
            value,
            error,
        });
    }

    fn write_value(&self, peer: &PeerId, characteristic: Uuid, data: &[u8], with_response: bool) {
        let (behavior, _, echo) = self.record(HostCall::WriteValue {
            peer: peer.clone(),
            characteristic,
            data: data.to_vec(),
            with_response,
        });
        if !with_response {
            return;
        }
        let (value, error) = match behavior.write {
            Reply::Silent => return,
            Reply::Fail(error) => (None, Some(error)),
            Reply::Respond => {
                if let Some(peripheral) = self.state.lock().peripherals.get_mut(peer) {
                    peripheral.values.insert(characteristic, data.to_vec());
                }
                (echo.then(|| data.to_vec()), None)
            }
        };
        self.emit(HostEvent::ValueWritten {
            peer: peer.clone(),
            characteristic,
            value,
            error,
        });
    }

    fn set_notify_value(&self, peer: &PeerId, characteristic: Uuid, enabled: bool) {
        let (behavior, _, _) = self.record(HostCall::SetNotifyValue {
            peer: peer.clone(),
            characteristic,
            enabled,
        });
        if behavior.notify == Reply::Silent {
            return;
        }
        self.emit(HostEvent::NotifyStateChanged {
            peer: peer.clone(),
            characteristic,
            enabled,
            error: failure(&behavior.notify),
        });
    }

    async fn retrieve_peers(&self, ids: &[PeerId]) -> Result<Vec<Peer>, BleError> {
        self.record(HostCall::RetrievePeers(ids.to_vec()));
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.peripherals.get(id).map(|p| p.peer.clone()))
            .collect())
    }
}
