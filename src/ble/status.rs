//! Adapter readiness gate
//!
//! Scans, connects and peripheral retrieval are held back until the host has
//! reported its adapter state at least once. The first report releases every
//! waiter; a usable adapter lets them proceed, anything else fails them.

use tokio::sync::watch;

use super::adapter::{AdapterState, BleError};

/// Tracks the latest adapter state reported by the host
#[derive(Debug)]
pub struct CentralStatusGate {
    state: watch::Sender<Option<AdapterState>>,
}

impl Default for CentralStatusGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralStatusGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    /// Record a state report from the host
    pub fn update(&self, state: AdapterState) {
        let previous = self.state.send_replace(Some(state));
        if previous != Some(state) {
            match state {
                AdapterState::PoweredOn => tracing::info!("📶 BLE adapter ready"),
                other => tracing::warn!("📵 BLE adapter state changed: {}", other),
            }
        }
    }

    /// Latest reported state, `None` until the host first reports
    pub fn current(&self) -> Option<AdapterState> {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.current() == Some(AdapterState::PoweredOn)
    }

    /// Wait until the host has reported a state, then fail unless it is usable.
    ///
    /// Only the first report matters: a waiter is not held across later
    /// transitions.
    pub async fn wait_ready(&self) -> Result<(), BleError> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(Option::is_some).await {
            Ok(state) => *state,
            // The sender lives in self, so the channel cannot close while we wait
            Err(_) => None,
        };
        match state {
            Some(state) => state.ensure_usable(),
            None => Err(BleError::AdapterUnavailable {
                reason: AdapterState::Unknown,
            }),
        }
    }

    /// Watch stream of state reports
    pub fn subscribe(&self) -> watch::Receiver<Option<AdapterState>> {
        self.state.subscribe()
    }
}
