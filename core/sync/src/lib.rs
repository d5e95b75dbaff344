//! Reconciliation engine for the offline-first data layer.
//!
//! Queues local mutations while the remote authority is unreachable,
//! replays the queue when connectivity returns, and refreshes full
//! collection state on demand. The engine guarantees read-your-writes:
//! a caller always observes its own mutation immediately, online or
//! offline.

pub mod connectivity;
pub mod engine;
pub mod remote;
pub mod scheduler;

pub use connectivity::ConnectivityMonitor;
pub use engine::{MutationResult, SyncEngine, SyncReport};
pub use remote::{HttpAuthority, LoginResponse, RemoteAuthority};
pub use scheduler::{spawn_sync_task, SyncConfig, SyncTaskHandle};
