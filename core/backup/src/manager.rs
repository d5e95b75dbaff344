//! Backup creation, restore, retention and portable export.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fieldsync_codec::{compress, decompress, Codec, CompressionLevel};
use fieldsync_common::{Error, Result};
use fieldsync_store::{SqliteStore, StoreSnapshot};

/// Format version written into every artifact. Bumped only on an
/// incompatible snapshot layout change.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Number of backups kept after a cleanup pass.
pub const DEFAULT_RETENTION: usize = 7;

/// Descriptive header of one backup artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Creation timestamp in milliseconds; doubles as the artifact key.
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
    /// Names of the snapshot sections contained in the artifact.
    pub collections: Vec<String>,
    /// CRC32 of the uncompressed canonical snapshot bytes.
    pub checksum: u32,
    pub compressed_size: usize,
}

/// Portable single-file form of a backup.
#[derive(Debug, Serialize, Deserialize)]
struct BackupEnvelope {
    metadata: BackupMetadata,
    /// Base64 of the compressed snapshot bytes.
    data: String,
}

/// Creates, restores, prunes and ports backup artifacts.
pub struct BackupManager {
    store: Arc<SqliteStore>,
    codec: Codec,
    level: CompressionLevel,
    retention: usize,
}

impl BackupManager {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            codec: Codec::default(),
            level: CompressionLevel::default(),
            retention: DEFAULT_RETENTION,
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Snapshot the whole store into a new backup artifact, then prune
    /// old ones down to the retention limit.
    pub async fn create_backup(&self) -> Result<BackupMetadata> {
        let snapshot = self.store.snapshot().await?;
        let bytes = serde_json::to_vec(&snapshot)?;
        let checksum = crc32fast::hash(&bytes);
        let compressed = compress(self.codec, self.level, &bytes)?;

        // Ids are creation timestamps; keep them strictly increasing even
        // when two backups land in the same millisecond.
        let mut id = Utc::now().timestamp_millis();
        if let Some((latest, _)) = self.store.list_backups().await?.first() {
            id = id.max(latest + 1);
        }

        let metadata = BackupMetadata {
            id,
            created_at: Utc::now(),
            format_version: BACKUP_FORMAT_VERSION,
            collections: snapshot.collection_names(),
            checksum,
            compressed_size: compressed.len(),
        };
        self.store
            .put_backup(id, &serde_json::to_string(&metadata)?, &compressed)
            .await?;
        info!(
            id,
            records = snapshot.record_count(),
            compressed_size = metadata.compressed_size,
            "backup created"
        );

        self.cleanup_old_backups().await?;
        Ok(metadata)
    }

    /// Replace the store contents with a backup's snapshot.
    ///
    /// The checksum is verified against the decompressed bytes first; on
    /// any mismatch the store is left untouched.
    pub async fn restore_backup(&self, id: i64) -> Result<BackupMetadata> {
        let (metadata_json, data) = self
            .store
            .backup(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backup {id}")))?;
        let metadata: BackupMetadata = serde_json::from_str(&metadata_json)?;

        let bytes = decompress(&data)?;
        let actual = crc32fast::hash(&bytes);
        if actual != metadata.checksum {
            return Err(Error::ChecksumMismatch {
                expected: metadata.checksum,
                actual,
            });
        }

        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        self.store.replace_all(&snapshot).await?;
        info!(id, records = snapshot.record_count(), "backup restored");
        Ok(metadata)
    }

    /// Metadata of every stored backup, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        self.store
            .list_backups()
            .await?
            .into_iter()
            .map(|(_, metadata)| serde_json::from_str(&metadata).map_err(Error::from))
            .collect()
    }

    /// Prune backups beyond the retention limit, oldest first. Returns
    /// the number of artifacts deleted.
    pub async fn cleanup_old_backups(&self) -> Result<usize> {
        let listed = self.store.list_backups().await?;
        let excess: Vec<i64> = listed.iter().skip(self.retention).map(|(id, _)| *id).collect();
        let mut pruned = 0;
        // Oldest first.
        for id in excess.into_iter().rev() {
            self.store.delete_backup(id).await?;
            pruned += 1;
        }
        if pruned > 0 {
            debug!(pruned, retained = self.retention, "old backups pruned");
        }
        Ok(pruned)
    }

    /// Serialize a backup into a single portable JSON document.
    pub async fn export_backup(&self, id: i64) -> Result<Vec<u8>> {
        let (metadata_json, data) = self
            .store
            .backup(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backup {id}")))?;
        let metadata: BackupMetadata = serde_json::from_str(&metadata_json)?;
        let envelope = BackupEnvelope {
            metadata,
            data: BASE64.encode(&data),
        };
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// Validate and store a backup exported by [`export_backup`].
    ///
    /// The artifact is fully verified (format version, payload decode,
    /// checksum) before it is accepted. Importing never restores; that
    /// stays a separate, explicit step.
    pub async fn import_backup(&self, bytes: &[u8]) -> Result<BackupMetadata> {
        let envelope: BackupEnvelope = serde_json::from_slice(bytes)?;
        let metadata = envelope.metadata;

        if metadata.format_version != BACKUP_FORMAT_VERSION {
            return Err(Error::InvalidInput(format!(
                "unsupported backup format version: {}",
                metadata.format_version
            )));
        }
        let data = BASE64
            .decode(&envelope.data)
            .map_err(|e| Error::InvalidInput(format!("backup payload is not valid base64: {e}")))?;

        let decompressed = decompress(&data)?;
        let actual = crc32fast::hash(&decompressed);
        if actual != metadata.checksum {
            warn!(id = metadata.id, "rejected import with bad checksum");
            return Err(Error::ChecksumMismatch {
                expected: metadata.checksum,
                actual,
            });
        }
        // The snapshot must parse now, not at restore time.
        let _: StoreSnapshot = serde_json::from_slice(&decompressed)?;

        self.store
            .put_backup(metadata.id, &serde_json::to_string(&metadata)?, &data)
            .await?;
        info!(id = metadata.id, "backup imported");
        Ok(metadata)
    }
}
