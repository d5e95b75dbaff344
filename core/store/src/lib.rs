//! Durable Local Store: a transactional, key-indexed persistent store.
//!
//! Holds the typed record collections plus auxiliary state (the session,
//! the pending-operation queue and backup artifacts). Every other
//! component of the engine reads and writes through this crate.

pub mod snapshot;
pub mod sqlite;

pub use snapshot::StoreSnapshot;
pub use sqlite::SqliteStore;
