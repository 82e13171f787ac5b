//! Platform-agnostic host BLE stack interface
//!
//! The radio driver and the GATT implementation belong to the host. This module
//! defines the capability interface the connection layer drives ([`HostStack`])
//! and the callbacks the host reports back ([`HostEvent`]), so platform-specific
//! backends and test doubles plug in behind the same seam.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stable identity of a remote peripheral, as assigned by the host stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A remote peripheral known to the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Host-assigned identifier
    pub id: PeerId,
    /// Advertised or GAP name, when the host knows one
    pub name: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }
}

/// Advertisement payload observed during a scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Local name carried in the advertisement
    pub local_name: Option<String>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// One advertisement observed for a peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralSighting {
    pub peer: Peer,
    pub advertisement: Advertisement,
    /// Signal strength in dBm
    pub rssi: i16,
}

/// Power and permission state of the host adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Succeeds only for [`AdapterState::PoweredOn`]
    pub fn ensure_usable(self) -> Result<(), BleError> {
        match self {
            AdapterState::PoweredOn => Ok(()),
            reason => Err(BleError::AdapterUnavailable { reason }),
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "powered off",
            AdapterState::PoweredOn => "powered on",
        };
        f.write_str(label)
    }
}

/// Options passed with a connection request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Ask the host to re-establish the link on its own after it drops.
    /// Hosts without the capability ignore the hint.
    pub auto_reconnect: bool,
}

/// Radio scan parameters handed to the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    /// Service UUIDs to filter on; empty means unfiltered
    pub services: Vec<Uuid>,
    /// Report every advertisement instead of once per peripheral
    pub allow_duplicates: bool,
}

/// Host BLE stack capability interface (Central role)
///
/// Commands are fire-and-forget: an implementation must not block and must not
/// call back into the caller synchronously. Every outcome is reported later as
/// a [`HostEvent`] on the channel handed to the implementation at construction.
#[async_trait]
pub trait HostStack: Send + Sync {
    /// Start (or re-issue with new parameters) the radio scan
    fn start_scan(&self, request: &ScanRequest);

    /// Stop the radio scan
    fn stop_scan(&self);

    /// Request a connection; answered by `Connected` or `ConnectFailed`
    fn connect(&self, peer: &PeerId, options: ConnectOptions);

    /// Tear down a connection or cancel a pending one; answered by `Disconnected`
    fn cancel_connection(&self, peer: &PeerId);

    /// Discover primary services; answered by `ServicesDiscovered`
    fn discover_services(&self, peer: &PeerId);

    /// Discover the characteristics of one service; answered by `CharacteristicsDiscovered`
    fn discover_characteristics(&self, peer: &PeerId, service: Uuid);

    /// Read a characteristic value; answered by `ValueUpdated`
    fn read_value(&self, peer: &PeerId, characteristic: Uuid);

    /// Write a characteristic value; answered by `ValueWritten` when
    /// `with_response` is set
    ///
    /// # Arguments
    /// * `peer` - Target peripheral
    /// * `characteristic` - Characteristic UUID
    /// * `data` - Payload to write
    /// * `with_response` - Request an acknowledged write
    fn write_value(&self, peer: &PeerId, characteristic: Uuid, data: &[u8], with_response: bool);

    /// Enable or disable notifications; answered by `NotifyStateChanged`
    fn set_notify_value(&self, peer: &PeerId, characteristic: Uuid, enabled: bool);

    /// Look up peripherals the host already knows by identifier.
    /// Unknown identifiers are left out of the result.
    async fn retrieve_peers(&self, ids: &[PeerId]) -> Result<Vec<Peer>, BleError>;
}

/// Callback reported by the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    AdapterStateChanged(AdapterState),
    PeripheralSighted(PeripheralSighting),
    Connected {
        peer: PeerId,
    },
    ConnectFailed {
        peer: PeerId,
        error: String,
    },
    Disconnected {
        peer: PeerId,
        error: Option<String>,
    },
    ServicesDiscovered {
        peer: PeerId,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    CharacteristicsDiscovered {
        peer: PeerId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    ValueUpdated {
        peer: PeerId,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        error: Option<String>,
    },
    ValueWritten {
        peer: PeerId,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        error: Option<String>,
    },
    NotifyStateChanged {
        peer: PeerId,
        characteristic: Uuid,
        enabled: bool,
        error: Option<String>,
    },
}

impl HostEvent {
    /// Peripheral the event concerns, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            HostEvent::AdapterStateChanged(_) => None,
            HostEvent::PeripheralSighted(sighting) => Some(&sighting.peer.id),
            HostEvent::Connected { peer }
            | HostEvent::ConnectFailed { peer, .. }
            | HostEvent::Disconnected { peer, .. }
            | HostEvent::ServicesDiscovered { peer, .. }
            | HostEvent::CharacteristicsDiscovered { peer, .. }
            | HostEvent::ValueUpdated { peer, .. }
            | HostEvent::ValueWritten { peer, .. }
            | HostEvent::NotifyStateChanged { peer, .. } => Some(peer),
        }
    }
}

/// Sending half handed to a [`HostStack`] implementation
pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;

/// Receiving half consumed by the central manager
pub type HostEventReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Create the channel that carries host callbacks into the core
pub fn host_event_channel() -> (HostEventSender, HostEventReceiver) {
    mpsc::unbounded_channel()
}

/// BLE-specific error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("BLE adapter unavailable: {reason}")]
    AdapterUnavailable { reason: AdapterState },

    #[error("BLE connection failed: {cause}")]
    ConnectFailed { cause: String },

    #[error("BLE peripheral disconnected")]
    Disconnected,

    #[error("BLE characteristic not found: {id}")]
    CharacteristicNotFound { id: Uuid },

    #[error("BLE communication timeout")]
    CommunicationTimeout,

    #[error("BLE communication failed: {cause}")]
    CommunicationError { cause: String },

    #[error("BLE peripheral not found: {id}")]
    PeripheralNotFound { id: PeerId },

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for BleError {
    fn from(err: btleplug::Error) -> Self {
        BleError::Platform(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_powered_on_is_usable() {
        assert!(AdapterState::PoweredOn.ensure_usable().is_ok());

        for state in [
            AdapterState::Unknown,
            AdapterState::Resetting,
            AdapterState::Unsupported,
            AdapterState::Unauthorized,
            AdapterState::PoweredOff,
        ] {
            assert_eq!(
                state.ensure_usable(),
                Err(BleError::AdapterUnavailable { reason: state })
            );
        }
    }

    #[test]
    fn test_event_peer_lookup() {
        let event = HostEvent::ValueUpdated {
            peer: PeerId::from("AA:BB"),
            characteristic: Uuid::nil(),
            value: None,
            error: None,
        };
        assert_eq!(event.peer().map(PeerId::as_str), Some("AA:BB"));
        assert!(HostEvent::AdapterStateChanged(AdapterState::PoweredOn)
            .peer()
            .is_none());
    }

    #[test]
    fn test_error_messages() {
        let err = BleError::AdapterUnavailable {
            reason: AdapterState::PoweredOff,
        };
        assert_eq!(err.to_string(), "BLE adapter unavailable: powered off");
        assert_eq!(
            BleError::CommunicationTimeout.to_string(),
            "BLE communication timeout"
        );
    }
}
