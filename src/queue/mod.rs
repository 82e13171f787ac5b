//! GATT operation queue
//!
//! Serializes characteristic reads and writes against a half-duplex transport:
//! - Strict FIFO by enqueue time, across every device sharing a serializer
//! - At most one operation in flight
//! - Cancellation before dispatch removes the entry; after dispatch the gate
//!   still advances when the transport answers or times out

pub mod operation;
pub mod serializer;

pub use operation::{
    OperationHandle, OperationId, OperationKind, OperationTarget, PendingOperation,
};
pub use serializer::{OperationQueueEntry, OperationSerializer};
