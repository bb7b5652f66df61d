//! faceprint-store: integrity-checked persistence of enrolled embeddings.
//!
//! Each identity owns three entries in the backend:
//!
//! - `embedding:{id}`: canonical JSON serialization of the embedding
//! - `embedding-digest:{id}`: hex SHA-256 of exactly those bytes
//! - `embedding-meta:{id}`: bookkeeping (`updated_at`), outside the digest
//!
//! A digest mismatch on load is reported as [`StoreError::Integrity`] and the
//! record is left in place; it is never repaired or treated as missing.

pub mod backend;

pub use backend::{MemoryBackend, SqliteBackend, StoreBackend};

use chrono::{DateTime, Utc};
use faceprint_core::types::{Embedding, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const EMBEDDING_PREFIX: &str = "embedding:";
const DIGEST_PREFIX: &str = "embedding-digest:";
const META_PREFIX: &str = "embedding-meta:";

/// Version of the canonical record layout.
pub const RECORD_FORMAT: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no embedding enrolled for identity '{0}'")]
    NotFound(String),
    #[error("integrity check failed for identity '{0}': stored digest does not match")]
    Integrity(String),
    #[error("invalid record for identity '{identity}': {reason}")]
    InvalidRecord { identity: String, reason: String },
    #[error("refusing to store embedding: {0}")]
    InvalidEmbedding(String),
    #[error("identity must be a non-empty string")]
    InvalidIdentity,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Canonical on-disk form of an embedding. Field order is fixed by the struct.
#[derive(Debug, Serialize, Deserialize)]
struct CanonicalRecord {
    format: u32,
    model_version: Option<String>,
    values: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordMeta {
    updated_at: DateTime<Utc>,
}

/// Identity plus bookkeeping, as returned by [`EmbeddingStore::identities`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledIdentity {
    pub identity: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Hex SHA-256 of a canonical serialization.
pub fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Serialize an embedding to its canonical text form.
pub fn canonical_serialization(embedding: &Embedding) -> Result<String, StoreError> {
    let record = CanonicalRecord {
        format: RECORD_FORMAT,
        model_version: embedding.model_version.clone(),
        values: embedding.values.clone(),
    };
    Ok(serde_json::to_string(&record)?)
}

/// One embedding per identity, with a digest verified on every load.
pub struct EmbeddingStore<B: StoreBackend> {
    backend: B,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EmbeddingStore<MemoryBackend> {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl<B: StoreBackend> EmbeddingStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Persist `embedding` for `identity`, replacing any previous record.
    pub fn save(&self, identity: &str, embedding: &Embedding) -> Result<(), StoreError> {
        check_identity(identity)?;
        if embedding.len() != EMBEDDING_DIM {
            return Err(StoreError::InvalidEmbedding(format!(
                "expected {EMBEDDING_DIM} values, got {}",
                embedding.len()
            )));
        }
        if embedding.values.iter().any(|v| !v.is_finite()) || !embedding.is_unit_norm() {
            return Err(StoreError::InvalidEmbedding("embedding is not unit-norm".into()));
        }

        let serialized = canonical_serialization(embedding)?;
        let digest = digest_hex(serialized.as_bytes());
        let meta = serde_json::to_string(&RecordMeta { updated_at: Utc::now() })?;

        self.with_identity_lock(identity, || {
            self.backend.put_all(&[
                (key(EMBEDDING_PREFIX, identity), serialized),
                (key(DIGEST_PREFIX, identity), digest),
                (key(META_PREFIX, identity), meta),
            ])
        })?;

        tracing::info!(identity, model_version = ?embedding.model_version, "embedding saved");
        Ok(())
    }

    /// Load and verify the embedding for `identity`.
    pub fn load(&self, identity: &str) -> Result<Embedding, StoreError> {
        check_identity(identity)?;
        self.with_identity_lock(identity, || self.read_record(identity))
    }

    fn read_record(&self, identity: &str) -> Result<Embedding, StoreError> {
        let serialized = self.backend.get(&key(EMBEDDING_PREFIX, identity))?;
        let stored_digest = self.backend.get(&key(DIGEST_PREFIX, identity))?;

        let (serialized, stored_digest) = match (serialized, stored_digest) {
            (None, None) => return Err(StoreError::NotFound(identity.to_string())),
            (Some(s), Some(d)) => (s, d),
            // Half a record cannot be trusted either way.
            _ => {
                tracing::warn!(identity, "embedding record is incomplete");
                return Err(StoreError::Integrity(identity.to_string()));
            }
        };

        if digest_hex(serialized.as_bytes()) != stored_digest.trim() {
            tracing::warn!(identity, "embedding digest mismatch");
            return Err(StoreError::Integrity(identity.to_string()));
        }

        let invalid = |reason: String| StoreError::InvalidRecord {
            identity: identity.to_string(),
            reason,
        };
        let record: CanonicalRecord =
            serde_json::from_str(&serialized).map_err(|e| invalid(format!("unparseable: {e}")))?;
        if record.format != RECORD_FORMAT {
            return Err(invalid(format!("unsupported record format {}", record.format)));
        }
        if record.values.len() != EMBEDDING_DIM {
            return Err(invalid(format!(
                "expected {EMBEDDING_DIM} values, got {}",
                record.values.len()
            )));
        }

        let embedding = Embedding {
            values: record.values,
            model_version: record.model_version,
        };
        if embedding.values.iter().any(|v| !v.is_finite()) || !embedding.is_unit_norm() {
            return Err(invalid("embedding is not unit-norm".into()));
        }

        tracing::debug!(identity, "embedding loaded");
        Ok(embedding)
    }

    /// Remove the record for `identity`. Returns whether anything was removed.
    pub fn delete(&self, identity: &str) -> Result<bool, StoreError> {
        check_identity(identity)?;
        let removed = self.with_identity_lock(identity, || {
            self.backend.remove_all(&[
                key(EMBEDDING_PREFIX, identity),
                key(DIGEST_PREFIX, identity),
                key(META_PREFIX, identity),
            ])
        })?;
        if removed > 0 {
            tracing::info!(identity, "embedding deleted");
        }
        Ok(removed > 0)
    }

    /// Whether any part of a record exists for `identity`.
    pub fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        check_identity(identity)?;
        Ok(self.backend.get(&key(EMBEDDING_PREFIX, identity))?.is_some()
            || self.backend.get(&key(DIGEST_PREFIX, identity))?.is_some())
    }

    /// Enrolled identities, sorted, with their last update time when known.
    pub fn identities(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let keys = self.backend.keys_with_prefix(EMBEDDING_PREFIX)?;
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let identity = k[EMBEDDING_PREFIX.len()..].to_string();
            let updated_at = self
                .backend
                .get(&key(META_PREFIX, &identity))?
                .and_then(|raw| serde_json::from_str::<RecordMeta>(&raw).ok())
                .map(|m| m.updated_at);
            out.push(EnrolledIdentity { identity, updated_at });
        }
        Ok(out)
    }

    /// Run `f` while holding the lock for `identity`.
    ///
    /// Entries live only while some caller holds or waits on them, so the
    /// table never outgrows the number of in-flight operations.
    fn with_identity_lock<T>(&self, identity: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                locks
                    .entry(identity.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Clones are only taken under the table lock, so a count of one
        // after ours is dropped means nobody else is holding or waiting.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(identity).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(identity);
        }
        result
    }
}

fn key(prefix: &str, identity: &str) -> String {
    format!("{prefix}{identity}")
}

fn check_identity(identity: &str) -> Result<(), StoreError> {
    if identity.trim().is_empty() {
        return Err(StoreError::InvalidIdentity);
    }
    Ok(())
}
