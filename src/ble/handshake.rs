//! Post-connect handshake and device profiles
//!
//! Some peripherals layer an application protocol on top of GATT and are only
//! usable once it has run. A [`Handshake`] is invoked after discovery; until it
//! succeeds the device keeps reporting `Discovering`. A [`DeviceProfile`]
//! decides which sighted peers become devices and which handshake they carry.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::adapter::{BleError, Peer};
use super::device::BleDevice;

/// Application-level initialization run once GATT is connected
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Run the handshake. The device accepts reads, writes and subscriptions
    /// while this runs.
    async fn initialize(&self, device: &BleDevice) -> Result<(), BleError>;
}

/// Decides how peers are turned into devices
pub trait DeviceProfile: Send + Sync {
    /// Whether a peer should become a device at all. Rejected peers are
    /// dropped from scan results.
    fn accepts(&self, _peer: &Peer) -> bool {
        true
    }

    /// Handshake the device runs after connecting, if any
    fn handshake(&self, _peer: &Peer) -> Option<Arc<dyn Handshake>> {
        None
    }
}

/// Accepts every peer, no handshake
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProfile;

impl DeviceProfile for DefaultProfile {}

/// Attaches the same handshake to every peer whose name starts with a prefix
pub struct NamedProfile {
    prefix: String,
    handshake: Option<Arc<dyn Handshake>>,
}

impl NamedProfile {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            handshake: None,
        }
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }
}

impl DeviceProfile for NamedProfile {
    fn accepts(&self, peer: &Peer) -> bool {
        peer.name
            .as_deref()
            .is_some_and(|name| name.starts_with(&self.prefix))
    }

    fn handshake(&self, _peer: &Peer) -> Option<Arc<dyn Handshake>> {
        self.handshake.clone()
    }
}

/// Handshake backed by an async closure
pub struct FnHandshake<F>(F);

impl<F, Fut> FnHandshake<F>
where
    F: Fn(BleDevice) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BleError>> + Send,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F, Fut> Handshake for FnHandshake<F>
where
    F: Fn(BleDevice) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BleError>> + Send,
{
    async fn initialize(&self, device: &BleDevice) -> Result<(), BleError> {
        (self.0)(device.clone()).await
    }
}
