//! Reservation management.
//!
//! This module provides:
//! - [`allocator`]: tuner allocation and conflict detection
//! - [`ExecutionSerializer`]: priority mutex for list mutations
//! - [`ReserveFile`]: the persisted reservation list
//! - [`ReservationStore`]: queries, mutations and rule resync

pub mod allocator;
pub mod file;
pub mod serializer;
pub mod store;

pub use file::{ReserveFile, ReserveFileError};
pub use serializer::{ExecutionGuard, ExecutionId, ExecutionSerializer};
pub use store::{now_ms, ReservationStore};
