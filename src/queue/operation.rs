//! Pending GATT operations
//!
//! A `PendingOperation` is created for every read or write call and resolved
//! exactly once: with the delivered payload, with an error, or by being
//! abandoned when its caller goes away.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::serializer::OperationSerializer;
use crate::ble::adapter::{BleError, PeerId};

/// Identifier assigned at enqueue time; strictly increasing per serializer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// What to do with the characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write { data: Vec<u8> },
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write { .. } => "write",
        }
    }
}

pub(crate) type Completion = oneshot::Sender<Result<Vec<u8>, BleError>>;

/// A read or write waiting for its turn at the transport
#[derive(Debug)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub characteristic: Uuid,
    /// When the caller issued the operation
    pub created_at: Instant,
    completion: Completion,
}

impl PendingOperation {
    pub(crate) fn new(
        id: OperationId,
        kind: OperationKind,
        characteristic: Uuid,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            kind,
            characteristic,
            created_at: Instant::now(),
            completion,
        }
    }

    /// Whether the caller has stopped waiting
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    /// Resolve the caller's handle. Consumes the operation so it resolves once.
    pub fn complete(self, result: Result<Vec<u8>, BleError>) {
        match &result {
            Ok(value) => tracing::debug!(
                "{} {} {} completed with {} byte(s) after {:?}",
                self.id,
                self.kind.label(),
                self.characteristic,
                value.len(),
                self.created_at.elapsed()
            ),
            Err(e) => tracing::debug!(
                "{} {} {} failed after {:?}: {}",
                self.id,
                self.kind.label(),
                self.characteristic,
                self.created_at.elapsed(),
                e
            ),
        }
        let _ = self.completion.send(result);
    }
}

/// Something operations can be dispatched against, normally a device
#[async_trait]
pub trait OperationTarget: Send + Sync {
    /// Peer the operation is addressed to
    fn target_id(&self) -> &PeerId;

    /// Run one operation against the transport and wait for its outcome
    async fn execute(&self, kind: &OperationKind, characteristic: Uuid)
        -> Result<Vec<u8>, BleError>;
}

/// Caller side of an enqueued operation.
///
/// Resolves with the operation's outcome. Dropping the handle before then
/// cancels the operation if it has not been dispatched yet; once dispatched it
/// runs to completion and its result is discarded.
#[must_use = "operations are cancelled when their handle is dropped"]
pub struct OperationHandle {
    id: OperationId,
    receiver: oneshot::Receiver<Result<Vec<u8>, BleError>>,
    serializer: Weak<OperationSerializer>,
    settled: bool,
}

impl OperationHandle {
    pub(crate) fn new(
        id: OperationId,
        receiver: oneshot::Receiver<Result<Vec<u8>, BleError>>,
        serializer: Weak<OperationSerializer>,
    ) -> Self {
        Self {
            id,
            receiver,
            serializer,
            settled: false,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl Future for OperationHandle {
    type Output = Result<Vec<u8>, BleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(result) => {
                self.settled = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(BleError::CommunicationError {
                        cause: "operation dropped before completion".to_string(),
                    })
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(serializer) = self.serializer.upgrade() {
            serializer.cancel(self.id);
        }
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}
