//! Bluetooth Low Energy GATT client
//!
//! Layered over a [`HostStack`] that owns the radio:
//! - [`CentralStatusGate`] holds requests until the adapter reports a usable state
//! - [`ScanBroker`] shares one host scan between any number of scan streams
//! - [`ConnectionBroker`] pairs connect/disconnect requests with host callbacks
//! - [`BleDevice`] runs each peer's connection state machine
//! - [`SubscriptionMultiplexer`] shares one notification toggle per characteristic
//!
//! [`CentralManager`] wires these together and routes host events.

pub mod adapter;
pub mod central;
pub mod connection;
pub mod device;
pub mod fake;
pub mod handshake;
pub mod registry;
pub mod scan;
pub mod status;
pub mod subscription;

#[cfg(feature = "ble")]
pub mod platform;

pub use adapter::{
    AdapterState, Advertisement, BleError, ConnectOptions, HostEvent, HostEventReceiver,
    HostEventSender, HostStack, Peer, PeerId, PeripheralSighting, ScanRequest,
    host_event_channel,
};
pub use central::{CentralManager, DeviceSighting};
pub use connection::ConnectionBroker;
pub use device::{BleDevice, ConnectionState, DeviceStateEvent};
pub use handshake::{DefaultProfile, DeviceProfile, FnHandshake, Handshake, NamedProfile};
pub use registry::DeviceRegistry;
pub use scan::{DuplicatePolicy, ScanBroker, ScanFilter};
pub use status::CentralStatusGate;
pub use subscription::{Notifications, NotifyLink, SubscriptionMultiplexer, SubscriptionStream};

#[cfg(feature = "ble")]
pub use platform::BtleplugHost;
