//! Shared radio scan with per-caller filtering
//!
//! Any number of callers can scan at once. They share one radio scan, issued
//! with the union of their service filters (unfiltered when any caller is
//! unfiltered) and re-issued whenever that union changes. Each caller's stream
//! applies its own service filter and duplicate policy on top. The radio scan
//! stops when the last stream is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use super::adapter::{BleError, HostStack, PeerId, PeripheralSighting, ScanRequest};
use super::status::CentralStatusGate;

/// Whether repeat advertisements from the same peer are reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Report each peer once per scan stream
    #[default]
    EmitOnce,
    /// Report every advertisement
    EmitAll,
}

/// Per-caller scan filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Advertised services to match; empty matches every peripheral
    pub services: Vec<Uuid>,
    pub duplicates: DuplicatePolicy,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        if !self.services.contains(&service) {
            self.services.push(service);
        }
        self
    }

    pub fn with_duplicates(mut self, duplicates: DuplicatePolicy) -> Self {
        self.duplicates = duplicates;
        self
    }

    /// Whether a sighting advertises one of the filtered services
    pub fn matches(&self, sighting: &PeripheralSighting) -> bool {
        self.services.is_empty()
            || sighting
                .advertisement
                .services
                .iter()
                .any(|service| self.services.contains(service))
    }
}

#[derive(Debug, Clone)]
enum ScanEvent {
    Sighting(PeripheralSighting),
    Aborted(BleError),
}

#[derive(Default)]
struct ScanState {
    next_id: u64,
    subscribers: HashMap<u64, ScanFilter>,
    /// Parameters of the radio scan currently running at the host
    active: Option<ScanRequest>,
}

/// Fans one radio scan out to concurrent scan streams
pub struct ScanBroker {
    host: Arc<dyn HostStack>,
    gate: Arc<CentralStatusGate>,
    events: broadcast::Sender<ScanEvent>,
    state: Mutex<ScanState>,
}

impl ScanBroker {
    pub fn new(host: Arc<dyn HostStack>, gate: Arc<CentralStatusGate>, buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            host,
            gate,
            events,
            state: Mutex::new(ScanState::default()),
        }
    }

    /// Scan for peripherals matching `filter`.
    ///
    /// The stream first waits for the adapter; if it is unusable the stream
    /// yields that error and ends without touching the radio.
    pub fn scan(
        self: &Arc<Self>,
        filter: ScanFilter,
    ) -> BoxStream<'static, Result<PeripheralSighting, BleError>> {
        stream::unfold(
            ScanPhase::Waiting(self.clone(), filter),
            |phase| async move {
                match phase {
                    ScanPhase::Waiting(broker, filter) => {
                        if let Err(e) = broker.gate.wait_ready().await {
                            tracing::warn!("🔍 Scan refused: {}", e);
                            return Some((Err(e), ScanPhase::Finished));
                        }
                        let subscription = ScanBroker::register(&broker, filter);
                        next_sighting(subscription).await
                    }
                    ScanPhase::Active(subscription) => next_sighting(subscription).await,
                    ScanPhase::Finished => None,
                }
            },
        )
        .boxed()
    }

    /// Forward a host sighting to every active scan stream
    pub fn publish(&self, sighting: PeripheralSighting) {
        let _ = self.events.send(ScanEvent::Sighting(sighting));
    }

    /// End every active scan stream with an error. The host scan is assumed gone.
    pub fn abort(&self, error: BleError) {
        let mut state = self.state.lock();
        if state.subscribers.is_empty() {
            return;
        }
        tracing::warn!(
            "🔍 Aborting {} scan stream(s): {}",
            state.subscribers.len(),
            error
        );
        state.subscribers.clear();
        state.active = None;
        let _ = self.events.send(ScanEvent::Aborted(error));
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Parameters of the radio scan currently running, if any
    pub fn active_request(&self) -> Option<ScanRequest> {
        self.state.lock().active.clone()
    }

    fn register(broker: &Arc<Self>, filter: ScanFilter) -> ScanSubscription {
        let mut state = broker.state.lock();
        // Subscribe before the host can start reporting
        let receiver = broker.events.subscribe();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, filter.clone());
        broker.apply(&mut state);

        ScanSubscription {
            broker: broker.clone(),
            id,
            receiver,
            filter,
            seen: HashSet::new(),
        }
    }

    fn unregister(&self, id: u64) {
        let mut state = self.state.lock();
        if state.subscribers.remove(&id).is_some() {
            self.apply(&mut state);
        }
    }

    /// Bring the host scan in line with the current subscribers
    fn apply(&self, state: &mut ScanState) {
        let wanted = union_request(state.subscribers.values());
        if wanted == state.active {
            return;
        }
        match &wanted {
            Some(request) => {
                tracing::info!(
                    "🔍 Starting BLE scan ({} service filter(s), duplicates: {})",
                    request.services.len(),
                    request.allow_duplicates
                );
                self.host.start_scan(request);
            }
            None => {
                tracing::info!("🛑 Stopping BLE scan");
                self.host.stop_scan();
            }
        }
        state.active = wanted;
    }
}

/// Most permissive radio scan covering every filter
fn union_request<'a>(filters: impl Iterator<Item = &'a ScanFilter>) -> Option<ScanRequest> {
    let mut any = false;
    let mut unfiltered = false;
    let mut allow_duplicates = false;
    let mut services = Vec::new();

    for filter in filters {
        any = true;
        unfiltered |= filter.services.is_empty();
        allow_duplicates |= filter.duplicates == DuplicatePolicy::EmitAll;
        for service in &filter.services {
            if !services.contains(service) {
                services.push(*service);
            }
        }
    }

    if !any {
        return None;
    }
    if unfiltered {
        services.clear();
    }
    services.sort();
    Some(ScanRequest {
        services,
        allow_duplicates,
    })
}

enum ScanPhase {
    Waiting(Arc<ScanBroker>, ScanFilter),
    Active(ScanSubscription),
    Finished,
}

/// One caller's registration; unregisters on drop
struct ScanSubscription {
    broker: Arc<ScanBroker>,
    id: u64,
    receiver: broadcast::Receiver<ScanEvent>,
    filter: ScanFilter,
    seen: HashSet<PeerId>,
}

impl Drop for ScanSubscription {
    fn drop(&mut self) {
        self.broker.unregister(self.id);
    }
}

async fn next_sighting(
    mut subscription: ScanSubscription,
) -> Option<(Result<PeripheralSighting, BleError>, ScanPhase)> {
    loop {
        match subscription.receiver.recv().await {
            Ok(ScanEvent::Sighting(sighting)) => {
                if !subscription.filter.matches(&sighting) {
                    continue;
                }
                if subscription.filter.duplicates == DuplicatePolicy::EmitOnce
                    && !subscription.seen.insert(sighting.peer.id.clone())
                {
                    continue;
                }
                return Some((Ok(sighting), ScanPhase::Active(subscription)));
            }
            Ok(ScanEvent::Aborted(error)) => {
                return Some((Err(error), ScanPhase::Finished));
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("🔍 Scan stream lagged, {} sighting(s) dropped", skipped);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
