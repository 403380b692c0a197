//! State management module.
//!
//! This module provides persistent storage for previously-applied resource
//! state, keyed by stack and resource id, together with per-stack published
//! outputs, operation history and advisory stack locks.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, KeyGuard, KeyLocks, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{HistoryEntry, StackOperation, StackOutputs, StackState, StateRecord, MAX_HISTORY, STATE_VERSION};
