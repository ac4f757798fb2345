//! State management for the groundwork engine.
//!
//! This module persists the last-known-applied record of every resource,
//! one document per environment, with advisory locking and a serialized
//! writer used while a plan is being applied.

mod ledger;
mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use ledger::StateLedger;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    ApplyHistoryEntry, ApplyOperation, RecordStatus, StateDocument, StateRecord, STATE_VERSION,
};
