//! Per-peer connect/disconnect deduplication
//!
//! At most one connect and one disconnect request per peer is outstanding at
//! the host. Callers arriving while a request is pending attach to it and
//! receive the same outcome; the entry is removed exactly once, when the host
//! answers, so the next caller after that starts a fresh request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::adapter::{BleError, ConnectOptions, HostStack, PeerId};
use super::status::CentralStatusGate;

type ConnectWaiters = broadcast::Sender<Result<(), BleError>>;
type DisconnectWaiters = broadcast::Sender<()>;

#[derive(Default)]
struct PendingRequests {
    connects: HashMap<PeerId, ConnectWaiters>,
    disconnects: HashMap<PeerId, DisconnectWaiters>,
}

/// Deduplicates connect and disconnect requests per peer
pub struct ConnectionBroker {
    host: Arc<dyn HostStack>,
    gate: Arc<CentralStatusGate>,
    disconnect_timeout: Duration,
    pending: Mutex<PendingRequests>,
}

impl ConnectionBroker {
    pub fn new(
        host: Arc<dyn HostStack>,
        gate: Arc<CentralStatusGate>,
        disconnect_timeout: Duration,
    ) -> Self {
        Self {
            host,
            gate,
            disconnect_timeout,
            pending: Mutex::new(PendingRequests::default()),
        }
    }

    /// Connect to a peer, joining an already pending attempt if there is one.
    ///
    /// Waits for the adapter to be usable before anything reaches the host.
    pub async fn connect(&self, peer: &PeerId, options: ConnectOptions) -> Result<(), BleError> {
        self.gate.wait_ready().await?;

        let mut outcome = {
            let mut pending = self.pending.lock();
            match pending.connects.get(peer) {
                Some(waiters) => {
                    tracing::debug!("Joining pending connect to {}", peer);
                    waiters.subscribe()
                }
                None => {
                    let (waiters, outcome) = broadcast::channel(1);
                    pending.connects.insert(peer.clone(), waiters);
                    tracing::info!("🔗 Connecting to peer: {}", peer);
                    self.host.connect(peer, options);
                    outcome
                }
            }
        };

        match outcome.recv().await {
            Ok(result) => result,
            Err(_) => Err(BleError::ConnectFailed {
                cause: "connect request dropped".to_string(),
            }),
        }
    }

    /// Disconnect from a peer, joining an already pending disconnect.
    ///
    /// Never gated on adapter state. Waiting for the host is bounded; on expiry
    /// the request is dropped and the peer is treated as gone.
    pub async fn disconnect(&self, peer: &PeerId) {
        let (waiters, mut outcome) = {
            let mut pending = self.pending.lock();
            match pending.disconnects.get(peer) {
                Some(waiters) => (waiters.clone(), waiters.subscribe()),
                None => {
                    let (waiters, outcome) = broadcast::channel(1);
                    pending.disconnects.insert(peer.clone(), waiters.clone());
                    tracing::info!("🔌 Disconnecting from peer: {}", peer);
                    self.host.cancel_connection(peer);
                    (waiters, outcome)
                }
            }
        };

        if tokio::time::timeout(self.disconnect_timeout, outcome.recv())
            .await
            .is_err()
        {
            tracing::warn!(
                "⏰ No disconnect callback from {} after {:?}",
                peer,
                self.disconnect_timeout
            );
            let mut pending = self.pending.lock();
            if pending
                .disconnects
                .get(peer)
                .is_some_and(|current| current.same_channel(&waiters))
            {
                pending.disconnects.remove(peer);
            }
        }
    }

    /// Host reported a completed connection. Returns whether a request was pending.
    pub fn on_connected(&self, peer: &PeerId) -> bool {
        let waiters = self.pending.lock().connects.remove(peer);
        match waiters {
            Some(waiters) => {
                tracing::info!("✅ Connected to peer: {}", peer);
                let _ = waiters.send(Ok(()));
                true
            }
            None => {
                tracing::debug!("Unsolicited connect callback for {}", peer);
                false
            }
        }
    }

    /// Host reported a failed connection attempt
    pub fn on_connect_failed(&self, peer: &PeerId, cause: String) {
        let waiters = self.pending.lock().connects.remove(peer);
        tracing::warn!("❌ Failed to connect to {}: {}", peer, cause);
        if let Some(waiters) = waiters {
            let _ = waiters.send(Err(BleError::ConnectFailed { cause }));
        }
    }

    /// Host reported the link gone.
    ///
    /// A connect still pending fails; a disconnect still pending resolves.
    /// Returns `true` when the link was torn down on request.
    pub fn on_disconnected(&self, peer: &PeerId, error: Option<&str>) -> bool {
        let (connect, disconnect) = {
            let mut pending = self.pending.lock();
            (
                pending.connects.remove(peer),
                pending.disconnects.remove(peer),
            )
        };

        if let Some(waiters) = connect {
            let cause = error
                .unwrap_or("disconnected before the connection completed")
                .to_string();
            let _ = waiters.send(Err(BleError::ConnectFailed { cause }));
        }

        match disconnect {
            Some(waiters) => {
                tracing::info!("🔌 Disconnected from peer: {}", peer);
                let _ = waiters.send(());
                true
            }
            None => {
                tracing::warn!(
                    "⚠️ Peer {} disconnected unexpectedly: {}",
                    peer,
                    error.unwrap_or("no reason given")
                );
                false
            }
        }
    }

    /// Fail every pending request, used when the adapter becomes unusable
    pub fn fail_all(&self, error: BleError) {
        let (connects, disconnects) = {
            let mut pending = self.pending.lock();
            (
                std::mem::take(&mut pending.connects),
                std::mem::take(&mut pending.disconnects),
            )
        };
        for (peer, waiters) in connects {
            tracing::debug!("Failing pending connect to {}: {}", peer, error);
            let _ = waiters.send(Err(error.clone()));
        }
        for (_, waiters) in disconnects {
            let _ = waiters.send(());
        }
    }

    pub fn is_connecting(&self, peer: &PeerId) -> bool {
        self.pending.lock().connects.contains_key(peer)
    }

    pub fn is_disconnecting(&self, peer: &PeerId) -> bool {
        self.pending.lock().disconnects.contains_key(peer)
    }
}
