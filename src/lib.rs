//! gattkit - client-side BLE GATT connection and operation-serialization layer
//!
//! Turns a callback-driven host Bluetooth stack into an async API: scan for
//! peripherals, connect with service discovery, then read, write and subscribe
//! to characteristics. Operations against the shared radio are serialized so
//! that at most one is in flight and results are never misattributed.

pub mod ble;
pub mod config;
pub mod queue;
pub mod util;

use std::sync::Arc;

use futures::stream::BoxStream;
use thiserror::Error;
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

pub use ble::{
    AdapterState, BleDevice, BleError, CentralManager, ConnectOptions, ConnectionState,
    DeviceProfile, DeviceSighting, DeviceStateEvent, HostStack, PeerId, ScanFilter,
    SubscriptionStream,
};
pub use config::{BleConfig, ConfigError, GatePolicy};
pub use queue::OperationHandle;

/// Async GATT client over one host adapter
#[derive(Clone)]
pub struct GattClient {
    central: CentralManager,
}

impl GattClient {
    /// Client over an arbitrary host stack and its event channel
    pub fn new(
        host: Arc<dyn HostStack>,
        events: ble::HostEventReceiver,
        config: BleConfig,
    ) -> Result<Self, GattKitError> {
        Ok(Self {
            central: CentralManager::new(host, events, config)?,
        })
    }

    /// Client whose devices are built through `profile`
    pub fn with_profile(
        host: Arc<dyn HostStack>,
        events: ble::HostEventReceiver,
        config: BleConfig,
        profile: Arc<dyn DeviceProfile>,
    ) -> Result<Self, GattKitError> {
        Ok(Self {
            central: CentralManager::with_profile(host, events, config, profile)?,
        })
    }

    /// Client over the system adapter
    #[cfg(feature = "ble")]
    pub async fn with_btleplug(config: BleConfig) -> Result<Self, GattKitError> {
        let (host, events) = ble::BtleplugHost::new().await?;
        Self::new(host, events, config)
    }

    pub fn central(&self) -> &CentralManager {
        &self.central
    }

    pub fn adapter_state(&self) -> Option<AdapterState> {
        self.central.adapter_state()
    }

    pub fn scan(&self, filter: ScanFilter) -> BoxStream<'static, Result<DeviceSighting, BleError>> {
        self.central.scan(filter)
    }

    pub async fn retrieve_devices(&self, ids: &[PeerId]) -> Result<Vec<BleDevice>, BleError> {
        self.central.retrieve_devices(ids).await
    }

    pub async fn connect(
        &self,
        device: &BleDevice,
        options: ConnectOptions,
    ) -> Result<(), BleError> {
        device.connect(options).await
    }

    pub async fn disconnect(&self, device: &BleDevice) {
        device.disconnect().await
    }

    pub fn connection_state(&self, device: &BleDevice) -> ConnectionState {
        device.connection_state()
    }

    pub fn state_changes(&self, device: &BleDevice) -> WatchStream<ConnectionState> {
        device.state_changes()
    }

    pub fn read(&self, device: &BleDevice, characteristic: Uuid) -> OperationHandle {
        device.read(characteristic)
    }

    pub fn write(
        &self,
        device: &BleDevice,
        characteristic: Uuid,
        data: impl Into<Vec<u8>>,
    ) -> OperationHandle {
        device.write(characteristic, data)
    }

    pub fn subscribe(&self, device: &BleDevice, characteristic: Uuid) -> SubscriptionStream {
        device.subscribe(characteristic)
    }

    pub fn devices(&self) -> Vec<BleDevice> {
        self.central.devices()
    }

    pub fn connected_devices(&self) -> Vec<BleDevice> {
        self.central.connected_devices()
    }

    pub fn connection_events(&self) -> BoxStream<'static, DeviceStateEvent> {
        self.central.connection_events()
    }
}

/// Error types for gattkit
#[derive(Error, Debug)]
pub enum GattKitError {
    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Bound on each in-flight read or write
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 3_000;

/// Window for a characteristic to appear after discovery
pub const DEFAULT_CHARACTERISTIC_LOOKUP_MS: u64 = 1_000;

/// Bound on service discovery during connect
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

/// Pause between reconnecting and re-discovering services
pub const DEFAULT_RECONNECT_SETTLE_MS: u64 = 500;

/// Bound on waiting for the host to confirm a disconnect
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 3_000;
