use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 8;
pub const DEFAULT_LEASE_TTL_MS: i64 = 120_000;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("unknown sync operation: {0}")]
    UnknownOperation(String),
    #[error("entry {entry_id} is not a conflict (operation {operation})")]
    NotAConflict {
        entry_id: i64,
        operation: SyncOperation,
    },
    #[error("invalid conflict payload: {reason}")]
    InvalidConflictPayload { reason: String },
}

/// What a queue entry asks the server to do. `Conflict` is never enqueued by a
/// writer; it only appears after the sync driver reports a rejected push.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    Conflict,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
            SyncOperation::Conflict => "conflict",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SyncOperation::Conflict)
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            "conflict" => Ok(SyncOperation::Conflict),
            other => Err(ContractError::UnknownOperation(other.to_string())),
        }
    }
}

/// Result of folding an incoming local mutation into the active entry that is
/// already queued for the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// Keep the entry, rewrite it to this operation with the new payload.
    Replace(SyncOperation),
    /// Nothing is left to tell the server; remove the entry.
    Drop,
}

/// Coalescing rules for an active entry. `dispatched` is true once the entry
/// has been handed to the sync driver at least once, after which the server
/// may already know about a `create`.
pub fn coalesce(existing: SyncOperation, incoming: SyncOperation, dispatched: bool) -> Coalesced {
    use SyncOperation::{Create, Delete, Update};

    match (existing, incoming) {
        (Create, Delete) if !dispatched => Coalesced::Drop,
        (Create, Delete) => Coalesced::Replace(Delete),
        (Create, _) => Coalesced::Replace(Create),
        (Update, Delete) => Coalesced::Replace(Delete),
        (Update, _) => Coalesced::Replace(Update),
        (Delete, Delete) => Coalesced::Replace(Delete),
        (Delete, _) => Coalesced::Replace(Update),
        (SyncOperation::Conflict, other) => Coalesced::Replace(other),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub leased_version: i64,
}

impl Lease {
    pub fn grant(now: DateTime<Utc>, ttl_ms: i64, payload_version: i64) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: now + Duration::milliseconds(ttl_ms.max(1)),
            leased_version: payload_version,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub max_retries: u32,
    pub payload_version: i64,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
}

impl QueueEntry {
    pub fn is_conflict(&self) -> bool {
        self.operation == SyncOperation::Conflict
    }

    /// Past its retry budget. Stuck entries stay queued until someone requeues them.
    pub fn is_stuck(&self) -> bool {
        self.operation.is_active() && self.retry_count > self.max_retries
    }

    pub fn lease_token(&self) -> Option<&str> {
        self.lease.as_ref().map(|lease| lease.token.as_str())
    }

    /// True when `token` is the lease currently recorded on the entry, expired or not.
    pub fn holds_lease(&self, token: &str) -> bool {
        self.lease_token() == Some(token)
    }

    pub fn conflict_record(&self) -> Result<ConflictRecord, ContractError> {
        if !self.is_conflict() {
            return Err(ContractError::NotAConflict {
                entry_id: self.id,
                operation: self.operation,
            });
        }
        ConflictRecord::from_payload(&self.payload)
    }
}

/// Payload stored in a queue entry once its push was rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub local_payload: Value,
    pub server_payload: Value,
    pub reason: String,
    pub rejected_operation: SyncOperation,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(
        local_payload: Value,
        server_payload: Value,
        reason: impl Into<String>,
        rejected_operation: SyncOperation,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_payload,
            server_payload,
            reason: reason.into(),
            rejected_operation,
            detected_at,
        }
    }

    /// A `null` server payload means the server no longer has the record.
    pub fn server_deleted(&self) -> bool {
        self.server_payload.is_null()
    }

    pub fn is_converged(&self) -> Result<bool, ContractError> {
        Ok(payload_hash(&self.local_payload)? == payload_hash(&self.server_payload)?)
    }

    pub fn to_payload(&self) -> Result<Value, ContractError> {
        serde_json::to_value(self).map_err(|err| ContractError::Serialization(err.to_string()))
    }

    pub fn from_payload(payload: &Value) -> Result<Self, ContractError> {
        let record: ConflictRecord = serde_json::from_value(payload.clone()).map_err(|err| {
            ContractError::InvalidConflictPayload {
                reason: err.to_string(),
            }
        })?;
        if record.rejected_operation == SyncOperation::Conflict {
            return Err(ContractError::InvalidConflictPayload {
                reason: "rejected operation cannot itself be a conflict".to_string(),
            });
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    Pending,
    Stuck,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Stuck => "stuck",
            SyncState::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The pushed payload was current; the record is synced.
    Removed,
    /// A local mutation landed while the push was in flight; the entry stays
    /// queued with the newer payload.
    Superseded,
    /// The caller's lease was cleared or taken over by another driver; the
    /// entry stays queued for whoever holds it now.
    StaleLease,
    /// Nothing to acknowledge (already removed, or cascaded away).
    Missing,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let json =
        serde_json::to_value(value).map_err(|err| ContractError::Serialization(err.to_string()))?;
    let canonical = canonicalize_value(json);
    serde_json::to_string(&canonical).map_err(|err| ContractError::Serialization(err.to_string()))
}

pub fn payload_hash<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let rendered = canonical_json(value)?;
    Ok(sha256_hex(rendered.as_bytes()))
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        scalar => scalar,
    }
}
