//! Backup and restore for the durable local store.
//!
//! A backup is an immutable artifact: the full store snapshot serialized
//! to canonical JSON, checksummed, compressed and stored alongside its
//! metadata. Restore verifies the checksum against the decompressed
//! bytes before touching the store, so a corrupt artifact can never
//! leave the store partially overwritten.

pub mod manager;
pub mod scheduler;

pub use manager::{BackupManager, BackupMetadata, BACKUP_FORMAT_VERSION, DEFAULT_RETENTION};
pub use scheduler::{spawn_backup_task, BackupConfig, BackupTaskHandle};
