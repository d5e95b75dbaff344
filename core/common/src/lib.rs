//! Common types and errors shared across Fieldsync modules.
//!
//! This crate defines the domain vocabulary of the offline-first data
//! layer: collections, records, the pending-operation queue entries and
//! the authenticated session, along with the single error taxonomy every
//! other crate maps into.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    AuthToken, Collection, OperationKind, PendingOperation, Record, RecordId, Session, SyncStatus,
    UserInfo,
};
