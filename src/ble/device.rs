//! Per-peer connection state machine
//!
//! A [`BleDevice`] owns one peer's lifecycle:
//! `Disconnected -> Connecting -> Discovering -> Connected -> Disconnecting -> Disconnected`.
//! Any failure drops it back to `Disconnected`, tearing down whatever transport
//! state was set up. Reads and writes go through the operation serializer and
//! are correlated with host callbacks by characteristic; notifications go
//! through the subscription multiplexer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use super::adapter::{BleError, ConnectOptions, HostStack, Peer, PeerId};
use super::connection::ConnectionBroker;
use super::handshake::Handshake;
use super::subscription::{NotifyLink, SubscriptionMultiplexer, SubscriptionStream};
use crate::config::BleConfig;
use crate::queue::{OperationHandle, OperationKind, OperationSerializer, OperationTarget};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Discovering,
    Connected,
    #[default]
    Disconnected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Discovering => "DISCOVERING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(label)
    }
}

/// A device changed its externally visible state
#[derive(Debug, Clone)]
pub struct DeviceStateEvent {
    pub device: BleDevice,
    pub state: ConnectionState,
}

/// Collaborators shared by every device of a central manager
#[derive(Clone)]
pub(crate) struct DeviceContext {
    pub host: Arc<dyn HostStack>,
    pub broker: Arc<ConnectionBroker>,
    pub config: Arc<BleConfig>,
    pub events: broadcast::Sender<DeviceStateEvent>,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), BleError>>>;

/// Waiting read or write, keyed by characteristic
struct Correlation {
    kind: CorrelationKind,
    /// Payload to resolve with when the host acknowledges without one
    fallback: Option<Vec<u8>>,
    completion: oneshot::Sender<Result<Vec<u8>, BleError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CorrelationKind {
    Read,
    Write,
}

impl Correlation {
    fn resolve(self, value: Option<Vec<u8>>, error: Option<String>) {
        let result = match error {
            Some(cause) => Err(BleError::CommunicationError { cause }),
            None => Ok(value.or(self.fallback).unwrap_or_default()),
        };
        let _ = self.completion.send(result);
    }
}

/// Service discovery in progress
struct Discovery {
    done: oneshot::Sender<Result<(), BleError>>,
    /// Services whose characteristics are still being discovered
    pending: HashSet<Uuid>,
}

/// Host-facing bookkeeping, guarded by one lock
#[derive(Default)]
struct GattState {
    correlations: HashMap<Uuid, Correlation>,
    discovery: Option<Discovery>,
    notify_waiters: HashMap<Uuid, oneshot::Sender<Result<(), BleError>>>,
}

struct DeviceInner {
    peer: Peer,
    ctx: DeviceContext,
    serializer: Arc<OperationSerializer>,
    handshake: Option<Arc<dyn Handshake>>,
    /// Transport-level state
    link: watch::Sender<ConnectionState>,
    /// State reported to callers; lags `link` while the handshake runs
    visible: watch::Sender<ConnectionState>,
    initialized: AtomicBool,
    /// Discovered characteristic -> owning service
    characteristics: watch::Sender<HashMap<Uuid, Uuid>>,
    gatt: Mutex<GattState>,
    subscriptions: Arc<SubscriptionMultiplexer>,
    connect_attempt: Mutex<Option<WeakShared<BoxFuture<'static, Result<(), BleError>>>>>,
    /// Auto-reconnect preference of the last connect, reused by reconnect
    auto_reconnect: AtomicBool,
    /// Orders state publication
    transitions: Mutex<()>,
}

/// Handle to one peer's connection state machine. Cheap to clone.
#[derive(Clone)]
pub struct BleDevice {
    inner: Arc<DeviceInner>,
}

impl BleDevice {
    pub(crate) fn new(
        peer: Peer,
        ctx: DeviceContext,
        serializer: Arc<OperationSerializer>,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionMultiplexer::new(
            peer.id.clone(),
            ctx.config.notification_buffer,
        ));
        let (link, _) = watch::channel(ConnectionState::Disconnected);
        let (visible, _) = watch::channel(ConnectionState::Disconnected);
        let (characteristics, _) = watch::channel(HashMap::new());

        Self {
            inner: Arc::new(DeviceInner {
                peer,
                ctx,
                serializer,
                handshake,
                link,
                visible,
                initialized: AtomicBool::new(false),
                characteristics,
                gatt: Mutex::new(GattState::default()),
                subscriptions,
                connect_attempt: Mutex::new(None),
                auto_reconnect: AtomicBool::new(false),
                transitions: Mutex::new(()),
            }),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }

    pub fn identifier(&self) -> &PeerId {
        &self.inner.peer.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.peer.name.as_deref()
    }

    /// Externally visible state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.visible.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Current state followed by every later change. Rapid transitions may be
    /// coalesced; use the central manager's connection events for every step.
    pub fn state_changes(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.inner.visible.subscribe())
    }

    /// Characteristics found by the last discovery
    pub fn characteristics(&self) -> Vec<Uuid> {
        self.inner.characteristics.borrow().keys().copied().collect()
    }

    pub fn has_handshake(&self) -> bool {
        self.inner.handshake.is_some()
    }

    /// Serializer this device's reads and writes go through. Shared with
    /// every other device under the global gate policy.
    pub fn operation_queue(&self) -> &Arc<OperationSerializer> {
        &self.inner.serializer
    }

    /// Connect and discover services, then run the handshake if there is one.
    ///
    /// Concurrent callers share one attempt. Dropping every caller before it
    /// completes tears the partial connection down.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), BleError> {
        self.start_connect(options, None).await
    }

    /// Disconnect, then connect again with the previous auto-reconnect
    /// preference, settling before service discovery
    pub async fn reconnect(&self) -> Result<(), BleError> {
        let options = ConnectOptions {
            auto_reconnect: self.inner.auto_reconnect.load(Ordering::SeqCst),
        };
        tracing::info!("🔄 Reconnecting to {}", self.identifier());
        self.disconnect().await;
        self.start_connect(options, Some(self.inner.ctx.config.reconnect_settle()))
            .await
    }

    /// Tear the connection down. Idempotent and best effort.
    pub async fn disconnect(&self) {
        let peer = self.identifier();
        let state = self.link_state();
        if state == ConnectionState::Disconnected && !self.inner.ctx.broker.is_connecting(peer) {
            return;
        }
        self.set_link_state(ConnectionState::Disconnecting);
        self.inner.ctx.broker.disconnect(peer).await;
        self.handle_link_lost(BleError::Disconnected);
    }

    /// Queue a characteristic read
    pub fn read(&self, characteristic: Uuid) -> OperationHandle {
        self.inner.serializer.enqueue(
            Arc::new(self.clone()),
            OperationKind::Read,
            characteristic,
        )
    }

    /// Queue an acknowledged characteristic write. Resolves with the payload
    /// the host reports, or the written data when it reports none.
    pub fn write(&self, characteristic: Uuid, data: impl Into<Vec<u8>>) -> OperationHandle {
        self.inner.serializer.enqueue(
            Arc::new(self.clone()),
            OperationKind::Write { data: data.into() },
            characteristic,
        )
    }

    /// Subscribe to notifications of a characteristic
    pub fn subscribe(&self, characteristic: Uuid) -> SubscriptionStream {
        self.inner
            .subscriptions
            .subscribe(Arc::new(self.clone()), characteristic)
    }

    fn start_connect(
        &self,
        options: ConnectOptions,
        settle: Option<Duration>,
    ) -> ConnectAttempt {
        let mut slot = self.inner.connect_attempt.lock();
        // A settled attempt may still be held by a waiter; never hand it out again
        if let Some(attempt) = slot.as_ref().and_then(WeakShared::upgrade) {
            if attempt.peek().is_none() {
                tracing::debug!("Joining connect attempt for {}", self.identifier());
                return attempt;
            }
        }

        let device = self.clone();
        let attempt = async move {
            if device.connection_state() == ConnectionState::Connected {
                return Ok(());
            }
            device.run_connect(options, settle).await
        }
        .boxed()
        .shared();
        *slot = attempt.downgrade();
        attempt
    }

    async fn run_connect(
        &self,
        options: ConnectOptions,
        settle: Option<Duration>,
    ) -> Result<(), BleError> {
        // Let a disconnect in progress finish first
        let mut link = self.inner.link.subscribe();
        let _ = link
            .wait_for(|state| *state != ConnectionState::Disconnecting)
            .await;

        self.inner
            .auto_reconnect
            .store(options.auto_reconnect, Ordering::SeqCst);
        let mut teardown = TeardownGuard::arm(self.clone());
        let result = self.establish(options, settle).await;
        teardown.disarm();

        if let Err(e) = &result {
            tracing::warn!("❌ Connect to {} failed: {}", self.identifier(), e);
            self.abort_connection(e).await;
        }
        result
    }

    async fn establish(
        &self,
        options: ConnectOptions,
        settle: Option<Duration>,
    ) -> Result<(), BleError> {
        let peer = self.identifier();
        self.set_link_state(ConnectionState::Connecting);
        self.inner.ctx.broker.connect(peer, options).await?;

        if let Some(settle) = settle {
            tokio::time::sleep(settle).await;
        }
        if !self.advance(ConnectionState::Connecting, ConnectionState::Discovering) {
            return Err(BleError::Disconnected);
        }
        self.discover().await?;
        if !self.advance(ConnectionState::Discovering, ConnectionState::Connected) {
            return Err(BleError::Disconnected);
        }

        if let Some(handshake) = self.inner.handshake.clone() {
            tracing::debug!("🤝 Running handshake with {}", peer);
            handshake.initialize(self).await?;
            if self.link_state() != ConnectionState::Connected {
                return Err(BleError::Disconnected);
            }
            self.mark_initialized();
        }
        tracing::info!("✅ Device ready: {}", peer);
        Ok(())
    }

    /// Fall back to `Disconnected` after a failed connect, releasing any
    /// transport state the attempt left behind
    async fn abort_connection(&self, error: &BleError) {
        let state = self.link_state();
        self.handle_link_lost(error.clone());

        let live = matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Discovering | ConnectionState::Connected
        );
        if live && !matches!(error, BleError::AdapterUnavailable { .. }) {
            self.inner.ctx.broker.disconnect(self.identifier()).await;
        }
    }

    async fn discover(&self) -> Result<(), BleError> {
        let (done, outcome) = oneshot::channel();
        self.inner.gatt.lock().discovery = Some(Discovery {
            done,
            pending: HashSet::new(),
        });
        self.inner.ctx.host.discover_services(self.identifier());

        let outcome = match self.inner.ctx.config.discovery_timeout() {
            Some(limit) => match tokio::time::timeout(limit, outcome).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.gatt.lock().discovery = None;
                    tracing::warn!(
                        "⏰ Service discovery on {} timed out after {:?}",
                        self.identifier(),
                        limit
                    );
                    return Err(BleError::ConnectFailed {
                        cause: "service discovery timed out".to_string(),
                    });
                }
            },
            None => outcome.await,
        };
        outcome.unwrap_or(Err(BleError::Disconnected))
    }

    /// Transport went away: clear caches and fail everything tied to the link
    pub(crate) fn handle_link_lost(&self, error: BleError) {
        let previous = self.set_link_state(ConnectionState::Disconnected);
        self.inner.characteristics.send_if_modified(|map| {
            let had = !map.is_empty();
            map.clear();
            had
        });

        let (correlations, discovery, notify_waiters) = {
            let mut gatt = self.inner.gatt.lock();
            (
                std::mem::take(&mut gatt.correlations),
                gatt.discovery.take(),
                std::mem::take(&mut gatt.notify_waiters),
            )
        };
        for (_, correlation) in correlations {
            let _ = correlation.completion.send(Err(error.clone()));
        }
        if let Some(discovery) = discovery {
            let _ = discovery.done.send(Err(error.clone()));
        }
        for (_, waiter) in notify_waiters {
            let _ = waiter.send(Err(error.clone()));
        }

        self.inner.subscriptions.close_all(error.clone());
        self.inner.serializer.fail_target(self.identifier(), error);

        if previous != ConnectionState::Disconnected {
            tracing::info!("🔌 Device {} disconnected", self.identifier());
        }
    }

    pub(crate) fn on_services_discovered(&self, services: Vec<Uuid>, error: Option<String>) {
        let mut gatt = self.inner.gatt.lock();
        let Some(discovery) = gatt.discovery.as_mut() else {
            tracing::debug!("Ignoring service discovery for {}", self.identifier());
            return;
        };

        if let Some(cause) = error {
            if let Some(discovery) = gatt.discovery.take() {
                let _ = discovery.done.send(Err(BleError::ConnectFailed { cause }));
            }
            return;
        }
        if services.is_empty() {
            if let Some(discovery) = gatt.discovery.take() {
                let _ = discovery.done.send(Ok(()));
            }
            return;
        }

        discovery.pending = services.iter().copied().collect();
        drop(gatt);
        tracing::debug!(
            "Discovered {} service(s) on {}",
            services.len(),
            self.identifier()
        );
        for service in services {
            self.inner
                .ctx
                .host
                .discover_characteristics(self.identifier(), service);
        }
    }

    pub(crate) fn on_characteristics_discovered(
        &self,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    ) {
        let mut gatt = self.inner.gatt.lock();
        if let Some(cause) = error {
            if let Some(discovery) = gatt.discovery.take() {
                let _ = discovery.done.send(Err(BleError::ConnectFailed { cause }));
            }
            return;
        }

        if self.link_state() != ConnectionState::Disconnected {
            self.inner.characteristics.send_modify(|map| {
                for characteristic in &characteristics {
                    map.insert(*characteristic, service);
                }
            });
        }

        let complete = gatt.discovery.as_mut().is_some_and(|discovery| {
            discovery.pending.remove(&service);
            discovery.pending.is_empty()
        });
        if complete {
            if let Some(discovery) = gatt.discovery.take() {
                let _ = discovery.done.send(Ok(()));
            }
        }
    }

    /// Read response or notification
    pub(crate) fn on_value_updated(
        &self,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        error: Option<String>,
    ) {
        if let Some(correlation) = self.take_correlation(characteristic, CorrelationKind::Read) {
            correlation.resolve(value, error);
            return;
        }
        match (value, error) {
            (_, Some(cause)) => tracing::warn!(
                "⚠️ Unsolicited value error on {} {}: {}",
                self.identifier(),
                characteristic,
                cause
            ),
            (Some(value), None) => {
                if !self.inner.subscriptions.deliver(characteristic, value) {
                    tracing::debug!(
                        "Dropping value for {} on {}: no subscriber",
                        characteristic,
                        self.identifier()
                    );
                }
            }
            (None, None) => {}
        }
    }

    pub(crate) fn on_value_written(
        &self,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        error: Option<String>,
    ) {
        match self.take_correlation(characteristic, CorrelationKind::Write) {
            Some(correlation) => correlation.resolve(value, error),
            None => tracing::debug!(
                "Unmatched write acknowledgement for {} on {}",
                characteristic,
                self.identifier()
            ),
        }
    }

    pub(crate) fn on_notify_state_changed(
        &self,
        characteristic: Uuid,
        enabled: bool,
        error: Option<String>,
    ) {
        if !enabled {
            if !self.inner.subscriptions.finish_disable(characteristic, error) {
                tracing::debug!(
                    "Unmatched notify-off callback for {} on {}",
                    characteristic,
                    self.identifier()
                );
            }
            return;
        }
        let waiter = self.inner.gatt.lock().notify_waiters.remove(&characteristic);
        if let Some(waiter) = waiter {
            let result = match error {
                Some(cause) => Err(BleError::CommunicationError { cause }),
                None => Ok(()),
            };
            let _ = waiter.send(result);
        }
    }

    fn take_correlation(&self, characteristic: Uuid, kind: CorrelationKind) -> Option<Correlation> {
        let mut gatt = self.inner.gatt.lock();
        match gatt.correlations.get(&characteristic) {
            Some(correlation) if correlation.kind == kind => {
                gatt.correlations.remove(&characteristic)
            }
            _ => None,
        }
    }

    /// Wait out `Connecting`/`Discovering`, then require `Connected`
    async fn wait_connected(&self) -> Result<(), BleError> {
        let mut link = self.inner.link.subscribe();
        let state = match link
            .wait_for(|state| {
                !matches!(
                    state,
                    ConnectionState::Connecting | ConnectionState::Discovering
                )
            })
            .await
        {
            Ok(state) => *state,
            Err(_) => ConnectionState::Disconnected,
        };
        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(BleError::Disconnected),
        }
    }

    /// Wait briefly for a characteristic to appear in the discovery cache.
    /// Fails with `Disconnected` as soon as the link leaves `Connected`.
    async fn lookup_characteristic(&self, characteristic: Uuid) -> Result<(), BleError> {
        let mut cache = self.inner.characteristics.subscribe();
        let mut link = self.inner.link.subscribe();
        let window = self.inner.ctx.config.characteristic_lookup();

        let lookup = async {
            tokio::select! {
                found = cache.wait_for(|map| map.contains_key(&characteristic)) => {
                    if found.is_ok() {
                        Ok(())
                    } else {
                        Err(BleError::Disconnected)
                    }
                }
                _ = link.wait_for(|state| *state != ConnectionState::Connected) => {
                    Err(BleError::Disconnected)
                }
            }
        };
        match tokio::time::timeout(window, lookup).await {
            Ok(result) => result,
            Err(_) => Err(BleError::CharacteristicNotFound { id: characteristic }),
        }
    }

    async fn execute_operation(
        &self,
        kind: &OperationKind,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        self.wait_connected().await?;
        self.lookup_characteristic(characteristic).await?;

        let peer = self.identifier();
        let (completion, outcome) = oneshot::channel();
        let (correlation_kind, fallback) = match kind {
            OperationKind::Read => (CorrelationKind::Read, None),
            OperationKind::Write { data } => (CorrelationKind::Write, Some(data.clone())),
        };
        {
            // Link loss drains correlations under this lock after marking the
            // link down, so checking here leaves no gap
            let mut gatt = self.inner.gatt.lock();
            if self.link_state() != ConnectionState::Connected {
                return Err(BleError::Disconnected);
            }
            gatt.correlations.insert(
                characteristic,
                Correlation {
                    kind: correlation_kind,
                    fallback,
                    completion,
                },
            );
        }

        match kind {
            OperationKind::Read => self.inner.ctx.host.read_value(peer, characteristic),
            OperationKind::Write { data } => {
                self.inner
                    .ctx
                    .host
                    .write_value(peer, characteristic, data, true)
            }
        }

        let limit = self.inner.ctx.config.operation_timeout();
        match tokio::time::timeout(limit, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BleError::Disconnected),
            Err(_) => {
                self.inner.gatt.lock().correlations.remove(&characteristic);
                tracing::warn!(
                    "⏰ {} {} on {} timed out after {:?}",
                    kind.label(),
                    characteristic,
                    peer,
                    limit
                );
                Err(BleError::CommunicationTimeout)
            }
        }
    }

    fn link_state(&self) -> ConnectionState {
        *self.inner.link.borrow()
    }

    /// Set the transport state, returning the previous one
    fn set_link_state(&self, state: ConnectionState) -> ConnectionState {
        let _order = self.inner.transitions.lock();
        let previous = self.inner.link.send_replace(state);
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Disconnected
        ) {
            self.inner.initialized.store(false, Ordering::SeqCst);
        }
        self.publish_visible();
        previous
    }

    /// Move from `from` to `to`; fails if something else changed the state
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let _order = self.inner.transitions.lock();
        let moved = self.inner.link.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            self.publish_visible();
        }
        moved
    }

    fn mark_initialized(&self) {
        let _order = self.inner.transitions.lock();
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.publish_visible();
    }

    /// Caller holds the transitions lock
    fn publish_visible(&self) {
        let link = *self.inner.link.borrow();
        let visible = if link == ConnectionState::Connected
            && self.inner.handshake.is_some()
            && !self.inner.initialized.load(Ordering::SeqCst)
        {
            ConnectionState::Discovering
        } else {
            link
        };

        let changed = self.inner.visible.send_if_modified(|current| {
            if *current != visible {
                *current = visible;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!("{} -> {}", self.identifier(), visible);
            let _ = self.inner.ctx.events.send(DeviceStateEvent {
                device: self.clone(),
                state: visible,
            });
        }
    }
}

#[async_trait]
impl OperationTarget for BleDevice {
    fn target_id(&self) -> &PeerId {
        self.identifier()
    }

    async fn execute(
        &self,
        kind: &OperationKind,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        self.execute_operation(kind, characteristic).await
    }
}

#[async_trait]
impl NotifyLink for BleDevice {
    async fn enable_notifications(&self, characteristic: Uuid) -> Result<(), BleError> {
        self.wait_connected().await?;
        self.lookup_characteristic(characteristic).await?;

        let (waiter, outcome) = oneshot::channel();
        {
            let mut gatt = self.inner.gatt.lock();
            if self.link_state() != ConnectionState::Connected {
                return Err(BleError::Disconnected);
            }
            gatt.notify_waiters.insert(characteristic, waiter);
        }
        self.inner
            .ctx
            .host
            .set_notify_value(self.identifier(), characteristic, true);

        match tokio::time::timeout(self.inner.ctx.config.operation_timeout(), outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BleError::Disconnected),
            Err(_) => {
                self.inner
                    .gatt
                    .lock()
                    .notify_waiters
                    .remove(&characteristic);
                Err(BleError::CommunicationTimeout)
            }
        }
    }

    fn disable_notifications(&self, characteristic: Uuid) -> bool {
        if self.link_state() != ConnectionState::Connected {
            return false;
        }
        self.inner
            .ctx
            .host
            .set_notify_value(self.identifier(), characteristic, false);
        true
    }
}

impl PartialEq for BleDevice {
    fn eq(&self, other: &Self) -> bool {
        self.identifier() == other.identifier()
    }
}

impl Eq for BleDevice {}

impl fmt::Debug for BleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleDevice")
            .field("id", self.identifier())
            .field("name", &self.name())
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Disconnects if a connect attempt is dropped before it finishes
struct TeardownGuard {
    device: Option<BleDevice>,
}

impl TeardownGuard {
    fn arm(device: BleDevice) -> Self {
        Self {
            device: Some(device),
        }
    }

    fn disarm(&mut self) {
        self.device = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        tracing::debug!("Connect to {} abandoned, tearing down", device.identifier());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { device.disconnect().await });
            }
            Err(_) => device.handle_link_lost(BleError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Discovering.to_string(), "DISCOVERING");
    }

    #[test]
    fn test_write_falls_back_to_request_payload() {
        let (completion, mut outcome) = oneshot::channel();
        Correlation {
            kind: CorrelationKind::Write,
            fallback: Some(vec![1, 2]),
            completion,
        }
        .resolve(None, None);
        assert_eq!(outcome.try_recv().unwrap(), Ok(vec![1, 2]));

        let (completion, mut outcome) = oneshot::channel();
        Correlation {
            kind: CorrelationKind::Write,
            fallback: Some(vec![1, 2]),
            completion,
        }
        .resolve(Some(vec![9]), None);
        assert_eq!(outcome.try_recv().unwrap(), Ok(vec![9]));
    }

    #[test]
    fn test_host_error_becomes_communication_error() {
        let (completion, mut outcome) = oneshot::channel();
        Correlation {
            kind: CorrelationKind::Read,
            fallback: None,
            completion,
        }
        .resolve(None, Some("insufficient authentication".into()));
        assert_eq!(
            outcome.try_recv().unwrap(),
            Err(BleError::CommunicationError {
                cause: "insufficient authentication".into()
            })
        );
    }
}
