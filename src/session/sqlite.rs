use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tokio::sync::Mutex;

use crate::core::error::Result;

use super::{InjectionRecord, SessionStore, StorageRecord};

const SESSION_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tbl_payload (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT,
    attempts INTEGER DEFAULT 0,
    payload TEXT,
    prepared_vector TEXT,
    backend TEXT,
    parameter TEXT,
    injection_type TEXT,
    payload_type TEXT,
    endpoint TEXT,
    param_type TEXT,
    string TEXT DEFAULT '',
    not_string TEXT DEFAULT '',
    attack01 TEXT DEFAULT '',
    cases TEXT DEFAULT '',
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(endpoint, parameter)
);

CREATE TABLE IF NOT EXISTS storage (
    type TEXT PRIMARY KEY,
    value TEXT,
    length INTEGER DEFAULT 0
);
";

/// Embedded SQLite session store, one file per target host. Writes are
/// serialised through a mutex so concurrent parameter scans commit in
/// wall-clock order.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool, write_lock: Mutex::new(()) })
    }

    /// Run raw SQL and collect the rows; the generic query entry point.
    pub async fn fetch_all(&self, query: &str, params: &[&str]) -> Result<Vec<SqliteRow>> {
        let mut q = sqlx::query(query);
        for p in params {
            q = q.bind(*p);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    /// Run an INSERT OR REPLACE / UPDATE statement.
    pub async fn upsert(&self, query: &str, params: &[&str]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut q = sqlx::query(query);
        for p in params {
            q = q.bind(*p);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    /// Execute a multi-statement DDL script.
    pub async fn execute_script(&self, ddl: &str) -> Result<()> {
        sqlx::raw_sql(ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Older session files predate the `cases` column; add it in place.
    async fn migrate(&self) -> Result<()> {
        let columns = self.fetch_all("PRAGMA table_info(tbl_payload)", &[]).await?;
        let has_cases = columns
            .iter()
            .any(|row| row.try_get::<String, _>("name").map(|n| n == "cases").unwrap_or(false));
        if !has_cases {
            tracing::debug!("adding missing 'cases' column to tbl_payload");
            self.execute_script("ALTER TABLE tbl_payload ADD COLUMN cases TEXT DEFAULT '';")
                .await?;
        }
        Ok(())
    }

    fn record_from_row(row: &SqliteRow) -> Result<InjectionRecord> {
        Ok(InjectionRecord {
            title: row.try_get("title")?,
            attempts: row.try_get("attempts")?,
            payload: row.try_get("payload")?,
            vector: row.try_get("prepared_vector")?,
            backend: row.try_get("backend")?,
            parameter: row.try_get("parameter")?,
            injection_type: row.try_get("injection_type")?,
            payload_type: row.try_get("payload_type")?,
            endpoint: row.try_get("endpoint")?,
            param_type: row.try_get("param_type")?,
            string: row.try_get("string")?,
            not_string: row.try_get("not_string")?,
            attack01: row.try_get("attack01")?,
            cases: row.try_get("cases")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        self.execute_script(SESSION_SCHEMA).await?;
        self.migrate().await
    }

    async fn injections_for_endpoint(&self, endpoint: &str) -> Result<Vec<InjectionRecord>> {
        let rows = self
            .fetch_all("SELECT * FROM tbl_payload WHERE endpoint = ?", &[endpoint])
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn upsert_injection(&self, record: &InjectionRecord) -> Result<()> {
        self.upsert(
            "INSERT OR REPLACE INTO tbl_payload \
             (title, attempts, payload, prepared_vector, backend, parameter, injection_type, \
              payload_type, endpoint, param_type, string, not_string, attack01, cases, timestamp) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
            &[
                &record.title,
                &record.attempts.to_string(),
                &record.payload,
                &record.vector,
                &record.backend,
                &record.parameter,
                &record.injection_type,
                &record.payload_type,
                &record.endpoint,
                &record.param_type,
                &record.string,
                &record.not_string,
                &record.attack01,
                &record.cases,
                &record.timestamp,
            ],
        )
        .await
    }

    async fn storage_get(&self, key: &str) -> Result<Option<StorageRecord>> {
        let rows = self
            .fetch_all("SELECT type, value, length FROM storage WHERE type = ?", &[key])
            .await?;
        match rows.first() {
            None => Ok(None),
            Some(row) => Ok(Some(StorageRecord {
                key: row.try_get("type")?,
                value: row.try_get("value")?,
                length: row.try_get("length")?,
            })),
        }
    }

    async fn storage_upsert(&self, record: &StorageRecord) -> Result<()> {
        self.upsert(
            "INSERT OR REPLACE INTO storage (type, value, length) VALUES (?,?,?)",
            &[&record.key, &record.value, &record.length.to_string()],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(dir.path().join("session.sqlite")).await.unwrap();
        store.init().await.unwrap();
        (dir, store)
    }

    fn record(endpoint: &str, parameter: &str) -> InjectionRecord {
        InjectionRecord {
            title: "AND boolean-based blind".into(),
            attempts: 12,
            payload: "' AND 6123=6123-- -".into(),
            vector: "{}".into(),
            backend: "MySQL".into(),
            parameter: parameter.into(),
            injection_type: "GET".into(),
            payload_type: "boolean-based blind".into(),
            endpoint: endpoint.into(),
            param_type: "GET".into(),
            string: String::new(),
            not_string: String::new(),
            attack01: String::new(),
            cases: "Content Length".into(),
            timestamp: "2026-02-14 10:00:00".into(),
        }
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (_dir, store) = fresh_store().await;
        store.init().await.unwrap();
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn injection_upsert_replaces_on_key() {
        let (_dir, store) = fresh_store().await;
        store.upsert_injection(&record("/vuln.php", "{\"key\":\"id\"}")).await.unwrap();
        let mut updated = record("/vuln.php", "{\"key\":\"id\"}");
        updated.backend = "PostgreSQL".into();
        store.upsert_injection(&updated).await.unwrap();

        let rows = store.injections_for_endpoint("/vuln.php").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].backend, "PostgreSQL");
    }

    #[tokio::test]
    async fn storage_roundtrip_and_resume_state() {
        let (_dir, store) = fresh_store().await;
        store
            .storage_upsert(&StorageRecord { key: "current_db".into(), value: "tes".into(), length: 6 })
            .await
            .unwrap();
        let rec = store.storage_get("current_db").await.unwrap().unwrap();
        assert_eq!(rec.value, "tes");
        assert!(!rec.is_complete());
        assert_eq!(store.storage_get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cases_column_added_to_legacy_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.sqlite");
        let store = SqliteStore::connect(&path).await.unwrap();
        // legacy layout without the cases column
        store
            .execute_script(
                "CREATE TABLE tbl_payload (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT, \
                 attempts INTEGER DEFAULT 0, payload TEXT, prepared_vector TEXT, backend TEXT, \
                 parameter TEXT, injection_type TEXT, payload_type TEXT, endpoint TEXT, \
                 param_type TEXT, string TEXT DEFAULT '', not_string TEXT DEFAULT '', \
                 attack01 TEXT DEFAULT '', timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, \
                 UNIQUE(endpoint, parameter));",
            )
            .await
            .unwrap();
        store.init().await.unwrap();
        store.upsert_injection(&record("/x", "p")).await.unwrap();
        let rows = store.injections_for_endpoint("/x").await.unwrap();
        assert_eq!(rows[0].cases, "Content Length");
    }
}
