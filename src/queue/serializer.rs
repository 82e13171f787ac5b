//! FIFO gate admitting one GATT operation at a time
//!
//! Enqueueing and "take the next entry if idle, mark busy" happen in the same
//! critical section, as do "mark idle, take the next entry". The gate therefore
//! never has two operations in flight and never stalls with work queued.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::Instrument;
use uuid::Uuid;

use super::operation::{
    OperationHandle, OperationId, OperationKind, OperationTarget, PendingOperation,
};
use crate::ble::adapter::{BleError, PeerId};

/// Queued operation and the target it runs against
pub struct OperationQueueEntry {
    pub operation: PendingOperation,
    pub target: Arc<dyn OperationTarget>,
}

#[derive(Default)]
struct GateState {
    queue: VecDeque<OperationQueueEntry>,
    in_flight: Option<OperationId>,
    next_id: u64,
}

/// Strict FIFO of pending operations with at most one in flight
pub struct OperationSerializer {
    /// Log label, "global" or the owning peer
    label: String,
    state: Mutex<GateState>,
}

impl OperationSerializer {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(GateState::default()),
        })
    }

    /// Queue an operation and return its handle immediately.
    ///
    /// Must be called from within a Tokio runtime; dispatch runs on spawned tasks.
    pub fn enqueue(
        self: &Arc<Self>,
        target: Arc<dyn OperationTarget>,
        kind: OperationKind,
        characteristic: Uuid,
    ) -> OperationHandle {
        let (completion, receiver) = oneshot::channel();
        let (id, next) = {
            let mut state = self.state.lock();
            let id = OperationId(state.next_id);
            state.next_id += 1;
            tracing::debug!(
                "[{}] queued {} {} on {} ({} ahead)",
                self.label,
                id,
                kind.label(),
                target.target_id(),
                state.queue.len() + usize::from(state.in_flight.is_some())
            );
            state.queue.push_back(OperationQueueEntry {
                operation: PendingOperation::new(id, kind, characteristic, completion),
                target,
            });
            (id, Self::take_next(&mut state))
        };

        if let Some(entry) = next {
            self.dispatch(entry);
        }
        OperationHandle::new(id, receiver, Arc::downgrade(self))
    }

    /// Remove a queued operation. In-flight operations are left to finish.
    pub fn cancel(&self, id: OperationId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let index = state
                .queue
                .iter()
                .position(|entry| entry.operation.id == id);
            index.and_then(|index| state.queue.remove(index))
        };
        match removed {
            Some(entry) => {
                tracing::debug!("[{}] cancelled queued {}", self.label, id);
                entry.operation.complete(Err(BleError::CommunicationError {
                    cause: "operation cancelled".to_string(),
                }));
                true
            }
            None => false,
        }
    }

    /// Fail every queued operation addressed to `peer`
    pub fn fail_target(&self, peer: &PeerId, error: BleError) -> usize {
        let failed = {
            let mut state = self.state.lock();
            let (failed, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.queue)
                .into_iter()
                .partition(|entry| entry.target.target_id() == peer);
            state.queue = kept;
            failed
        };

        if !failed.is_empty() {
            tracing::debug!(
                "[{}] failing {} queued operation(s) for {}: {}",
                self.label,
                failed.len(),
                peer,
                error
            );
        }
        let count = failed.len();
        for entry in failed {
            entry.operation.complete(Err(error.clone()));
        }
        count
    }

    /// Number of queued operations, not counting the one in flight
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No operation queued or in flight
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.in_flight.is_none()
    }

    pub fn in_flight(&self) -> Option<OperationId> {
        self.state.lock().in_flight
    }

    /// Pop the next live entry and mark it in flight, if the gate is idle.
    /// Caller holds the lock.
    fn take_next(state: &mut GateState) -> Option<OperationQueueEntry> {
        if state.in_flight.is_some() {
            return None;
        }
        while let Some(entry) = state.queue.pop_front() {
            if entry.operation.is_abandoned() {
                tracing::debug!("skipping abandoned {}", entry.operation.id);
                continue;
            }
            state.in_flight = Some(entry.operation.id);
            return Some(entry);
        }
        None
    }

    fn dispatch(self: &Arc<Self>, entry: OperationQueueEntry) {
        let serializer = self.clone();
        let OperationQueueEntry { operation, target } = entry;
        let span = tracing::debug_span!(
            "gatt_operation",
            peer = %target.target_id(),
            characteristic = %operation.characteristic,
            op = operation.kind.label(),
        );

        tokio::spawn(
            async move {
                let id = operation.id;
                let result = target
                    .execute(&operation.kind, operation.characteristic)
                    .await;
                operation.complete(result);
                serializer.finish(id);
            }
            .instrument(span),
        );
    }

    fn finish(self: &Arc<Self>, id: OperationId) {
        let next = {
            let mut state = self.state.lock();
            if state.in_flight == Some(id) {
                state.in_flight = None;
            }
            Self::take_next(&mut state)
        };
        if let Some(entry) = next {
            self.dispatch(entry);
        }
    }
}
