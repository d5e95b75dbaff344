//! Common types used throughout Fieldsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use zeroize::Zeroize;

/// Compile-time enumeration of the record collections held by the store.
///
/// Every store and engine operation is keyed by one of these variants, so
/// an unknown collection name is a parse error at the boundary rather than
/// a runtime lookup failure deep inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Registered people (children) being followed in the field.
    Children,
    /// Health screenings recorded for a child.
    Screenings,
    /// Referrals derived from screening outcomes.
    Referrals,
}

impl Collection {
    /// All collections, in the order they are serialized into snapshots.
    pub const ALL: [Collection; 3] = [
        Collection::Children,
        Collection::Screenings,
        Collection::Referrals,
    ];

    /// Stable name used as store key and remote path segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Children => "children",
            Collection::Screenings => "screenings",
            Collection::Referrals => "referrals",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "children" => Ok(Collection::Children),
            "screenings" => Ok(Collection::Screenings),
            "referrals" => Ok(Collection::Referrals),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown collection: {other}"
            ))),
        }
    }
}

/// Identifier of a record.
///
/// `Server` ids are assigned by the remote authority once a create has
/// been confirmed. Until then a record carries a `Local` placeholder that
/// only exists in this store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordId {
    Server(i64),
    Local(Uuid),
}

impl RecordId {
    /// Generate a fresh local placeholder id.
    pub fn new_local() -> Self {
        RecordId::Local(Uuid::new_v4())
    }

    /// Whether this id has been assigned by the remote authority.
    pub fn is_server(&self) -> bool {
        matches!(self, RecordId::Server(_))
    }

    /// The server-assigned integer, if any.
    pub fn server_id(&self) -> Option<i64> {
        match self {
            RecordId::Server(id) => Some(*id),
            RecordId::Local(_) => None,
        }
    }

    /// Stable string form used as the store key: `s:<int>` or `l:<uuid>`.
    pub fn to_key(&self) -> String {
        match self {
            RecordId::Server(id) => format!("s:{id}"),
            RecordId::Local(uuid) => format!("l:{uuid}"),
        }
    }

    /// Parse a store key produced by [`RecordId::to_key`].
    pub fn parse_key(key: &str) -> crate::Result<Self> {
        if let Some(rest) = key.strip_prefix("s:") {
            let id = rest
                .parse::<i64>()
                .map_err(|_| crate::Error::InvalidInput(format!("bad record key: {key}")))?;
            Ok(RecordId::Server(id))
        } else if let Some(rest) = key.strip_prefix("l:") {
            let uuid = Uuid::parse_str(rest)
                .map_err(|_| crate::Error::InvalidInput(format!("bad record key: {key}")))?;
            Ok(RecordId::Local(uuid))
        } else {
            Err(crate::Error::InvalidInput(format!(
                "bad record key: {key}"
            )))
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Sync status of a single record.
///
/// A record is `Pending` or `Error` whenever its locally-held payload has
/// not been confirmed by the remote authority since its last mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Confirmed by the remote authority.
    Synced,
    /// Local mutation queued, awaiting confirmation.
    Pending,
    /// Last replay attempt was rejected or failed; retried next pass.
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "error" => Ok(SyncStatus::Error),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown sync status: {other}"
            ))),
        }
    }
}

/// One entity instance in a collection.
///
/// The payload is an opaque JSON object; the engine never interprets
/// domain fields beyond the optional index lookups the store offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub payload: serde_json::Value,
    pub sync_status: SyncStatus,
    pub last_modified: DateTime<Utc>,
}

impl Record {
    /// Create a record with a fresh local id, marked pending.
    pub fn new_local(payload: serde_json::Value) -> Self {
        Self {
            id: RecordId::new_local(),
            payload,
            sync_status: SyncStatus::Pending,
            last_modified: Utc::now(),
        }
    }

    /// Create a record from an authority-confirmed payload.
    pub fn new_synced(id: i64, payload: serde_json::Value) -> Self {
        Self {
            id: RecordId::Server(id),
            payload,
            sync_status: SyncStatus::Synced,
            last_modified: Utc::now(),
        }
    }
}

/// Kind of a queued local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// A queued local mutation awaiting remote confirmation.
///
/// Removed from the queue only after the remote authority confirms it;
/// replayed in `seq` order per collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Store-assigned monotonic sequence number (enqueue order).
    pub seq: i64,
    pub kind: OperationKind,
    pub collection: Collection,
    pub record_id: RecordId,
    /// Full record payload; `None` for deletes.
    pub payload: Option<serde_json::Value>,
    /// Username of the identity that made the mutation.
    pub user: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Authenticated identity as reported by the remote authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
}

/// Bearer credential, zeroized on drop and redacted in debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Expose the secret for attaching to a request.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// The current authenticated session.
///
/// Exactly one is held at a time: overwritten on login, cleared on logout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user: UserInfo,
    pub token: AuthToken,
    /// Timestamp of the last successful full-state refresh.
    pub last_full_sync: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user: UserInfo, token: AuthToken) -> Self {
        Self {
            user,
            token,
            last_full_sync: None,
        }
    }
}
