pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;

/// The confirmed artefact per (endpoint, parameter): everything needed to
/// rebuild the vector and its oracle without re-probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionRecord {
    pub title: String,
    pub attempts: i64,
    pub payload: String,
    /// Serialized [`crate::payloads::Vector`], the prepared skeleton.
    pub vector: String,
    pub backend: String,
    /// Serialized [`crate::http::Parameter`].
    pub parameter: String,
    pub injection_type: String,
    pub payload_type: String,
    pub endpoint: String,
    pub param_type: String,
    pub string: String,
    pub not_string: String,
    /// Serialized false-attack [`crate::http::ResponseEnvelope`].
    pub attack01: String,
    pub cases: String,
    pub timestamp: String,
}

/// Per-extraction resume state. `len(value) == length` marks completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Unique key such as `current_db` or `dump:<db>.<tbl>.<col>:<row>`.
    pub key: String,
    pub value: String,
    pub length: i64,
}

impl StorageRecord {
    pub fn is_complete(&self) -> bool {
        self.value.chars().count() as i64 == self.length
    }
}

/// Durable key-value store with two logical tables: confirmed injections and
/// extraction storage. The default implementation is an embedded SQLite
/// file; tests use an in-memory map.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Idempotent schema initialisation (including in-place migrations).
    async fn init(&self) -> Result<()>;

    async fn injections_for_endpoint(&self, endpoint: &str) -> Result<Vec<InjectionRecord>>;

    /// Upsert keyed on (endpoint, serialized parameter).
    async fn upsert_injection(&self, record: &InjectionRecord) -> Result<()>;

    async fn storage_get(&self, key: &str) -> Result<Option<StorageRecord>>;

    /// Upsert keyed on `key`.
    async fn storage_upsert(&self, record: &StorageRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_length_equality() {
        let partial = StorageRecord { key: "current_db".into(), value: "tes".into(), length: 6 };
        assert!(!partial.is_complete());
        let done = StorageRecord { key: "current_db".into(), value: "testdb".into(), length: 6 };
        assert!(done.is_complete());
    }
}
