//! Fingerprint store implementations.
//!
//! [`Storage`] persists one checksummed record per source unit in an embedded
//! libSQL database, plus the build run history. [`MemoryStore`] keeps the same
//! data in memory for tests and dry runs.
//!
//! **Access rules:**
//! - `docvault build` / `clean`: read-write via [`Storage::open_or_recover`]
//! - `docvault status`: read-only via [`Storage::open_readonly`]

mod memory;
mod migrations;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use docvault_shared::{
    DocVaultError, Fingerprint, FingerprintRecord, FingerprintStore, RECORD_SCHEMA_VERSION,
    Result, RunSummary, StoreSnapshot, StoreStats, UnitId,
};
use libsql::{Connection, Database, params};
use tracing::{debug, warn};
use uuid::Uuid;

pub use memory::MemoryStore;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Set when an unreadable database was moved aside on open.
    recovered: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocVaultError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            recovered: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open the database, moving an unreadable file aside and starting fresh.
    ///
    /// A corrupt state file degrades to a full rebuild instead of failing the
    /// build. Only a failure to create the fresh database is returned.
    pub async fn open_or_recover(path: &Path) -> Result<Self> {
        match Self::open(path).await {
            Ok(storage) => Ok(storage),
            Err(err) if path.exists() => {
                let aside = quarantine_path(path);
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "state database unreadable, starting from an empty store"
                );
                std::fs::rename(path, &aside).map_err(|e| DocVaultError::io(path, e))?;
                for suffix in ["-wal", "-shm"] {
                    let sidecar = sibling_with_suffix(path, suffix);
                    if sidecar.exists() {
                        let _ = std::fs::remove_file(&sidecar);
                    }
                }
                let mut storage = Self::open(path).await?;
                storage.recovered = true;
                Ok(storage)
            }
            Err(err) => Err(err),
        }
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            recovered: false,
        })
    }

    /// Whether [`Storage::open_or_recover`] had to discard the previous file.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DocVaultError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DocVaultError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// List every unit id with its decoded record, or `None` when the entry is damaged.
    async fn scan_records(&self) -> Result<Vec<(UnitId, Option<FingerprintRecord>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT unit_id, record_json, checksum FROM fingerprints ORDER BY unit_id",
                params![],
            )
            .await
            .map_err(|e| DocVaultError::corruption(e.to_string()))?;

        let mut results = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DocVaultError::corruption(e.to_string())),
            };
            let Ok(unit_id) = row.get::<String>(0) else {
                warn!("fingerprint row without a readable unit id, ignoring");
                continue;
            };
            let unit_id = UnitId::from(unit_id);
            let record = match (row.get::<String>(1), row.get::<String>(2)) {
                (Ok(json), Ok(checksum)) => decode_record(&unit_id, &json, &checksum),
                _ => None,
            };
            results.push((unit_id, record));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Test helpers
    // -----------------------------------------------------------------------

    #[cfg(test)]
    async fn write_raw(&self, unit_id: &str, json: &str, checksum: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO fingerprints (unit_id, record_json, checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(unit_id) DO UPDATE SET
                   record_json = excluded.record_json,
                   checksum = excluded.checksum",
                params![unit_id, json, checksum, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl FingerprintStore for Storage {
    async fn load_all(&self) -> Result<StoreSnapshot> {
        let mut snapshot = StoreSnapshot {
            reset: self.recovered,
            ..StoreSnapshot::default()
        };
        for (unit_id, record) in self.scan_records().await? {
            match record {
                Some(record) => {
                    snapshot.records.insert(unit_id, record);
                }
                None => snapshot.corrupt.push(unit_id),
            }
        }
        debug!(
            records = snapshot.records.len(),
            corrupt = snapshot.corrupt.len(),
            "loaded fingerprint store"
        );
        Ok(snapshot)
    }

    async fn get(&self, unit_id: &UnitId) -> Result<Option<FingerprintRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json, checksum FROM fingerprints WHERE unit_id = ?1",
                params![unit_id.as_str()],
            )
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json = row
                    .get::<String>(0)
                    .map_err(|e| DocVaultError::Storage(e.to_string()))?;
                let checksum = row
                    .get::<String>(1)
                    .map_err(|e| DocVaultError::Storage(e.to_string()))?;
                Ok(decode_record(unit_id, &json, &checksum))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DocVaultError::Storage(e.to_string())),
        }
    }

    async fn commit(&self, record: &FingerprintRecord) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(record)
            .map_err(|e| DocVaultError::Storage(format!("encode record: {e}")))?;
        let checksum = Fingerprint::of_bytes(json.as_bytes());
        let now = Utc::now().to_rfc3339();

        // A single upsert statement: SQLite journals it, so the row is
        // replaced as a whole or not at all.
        self.conn
            .execute(
                "INSERT INTO fingerprints (unit_id, record_json, checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(unit_id) DO UPDATE SET
                   record_json = excluded.record_json,
                   checksum = excluded.checksum,
                   updated_at = excluded.updated_at",
                params![
                    record.unit_id.as_str(),
                    json.as_str(),
                    checksum.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, unit_id: &UnitId) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM fingerprints WHERE unit_id = ?1",
                params![unit_id.as_str()],
            )
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let summary_json = serde_json::to_string(summary)
            .map_err(|e| DocVaultError::Storage(format!("encode run summary: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO build_runs (id, finished_at, full_build, summary_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.as_str(),
                    now.as_str(),
                    i64::from(summary.full_build),
                    summary_json.as_str(),
                ],
            )
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn last_full_build(&self) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT finished_at FROM build_runs WHERE full_build = 1
                 ORDER BY finished_at DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let finished: String = row
                    .get(0)
                    .map_err(|e| DocVaultError::Storage(e.to_string()))?;
                Ok(parse_timestamp(&finished))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DocVaultError::Storage(e.to_string())),
        }
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for (unit_id, record) in self.scan_records().await? {
            match record {
                Some(record) => {
                    stats.tracked_units += 1;
                    if record.is_failure() {
                        stats.failed_units.push(unit_id);
                    }
                }
                None => stats.corrupt_records += 1,
            }
        }

        let mut rows = self
            .conn
            .query(
                "SELECT finished_at, summary_json, (SELECT COUNT(*) FROM build_runs)
                 FROM build_runs ORDER BY finished_at DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;

        if let Ok(Some(row)) = rows.next().await {
            stats.last_run_at = row.get::<String>(0).ok().and_then(|s| parse_timestamp(&s));
            stats.last_run = row
                .get::<String>(1)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok());
            stats.runs = row.get::<u32>(2).unwrap_or(0) as usize;
        }

        stats.last_full_build = self.last_full_build().await?;
        Ok(stats)
    }

    async fn clear(&self) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute_batch("DELETE FROM fingerprints; DELETE FROM build_runs;")
            .await
            .map_err(|e| DocVaultError::Storage(e.to_string()))?;
        tracing::info!("fingerprint store cleared");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Verify and decode one persisted record. Any mismatch reads as damaged.
fn decode_record(unit_id: &UnitId, json: &str, checksum: &str) -> Option<FingerprintRecord> {
    if Fingerprint::of_bytes(json.as_bytes()).as_str() != checksum {
        warn!(%unit_id, "fingerprint record checksum mismatch");
        return None;
    }
    let record: FingerprintRecord = match serde_json::from_str(json) {
        Ok(record) => record,
        Err(e) => {
            warn!(%unit_id, error = %e, "fingerprint record undecodable");
            return None;
        }
    };
    if &record.unit_id != unit_id || record.schema_version != RECORD_SCHEMA_VERSION {
        warn!(%unit_id, "fingerprint record does not match its key or schema");
        return None;
    }
    Some(record)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn quarantine_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, &format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use docvault_shared::{BuildStatus, FailureKind, UnitFailure};

    use super::*;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("docvault_test_{}.db", Uuid::now_v7()))
    }

    async fn test_storage() -> Storage {
        Storage::open(&temp_db_path()).await.expect("open storage")
    }

    fn record(id: &str, status: BuildStatus) -> FingerprintRecord {
        let mut deps = BTreeMap::new();
        deps.insert(UnitId::from("pkg.base"), Some(Fingerprint::of_bytes(b"base-out")));
        FingerprintRecord {
            schema_version: RECORD_SCHEMA_VERSION,
            unit_id: UnitId::from(id),
            input_fingerprint: Fingerprint::of_bytes(id.as_bytes()),
            output_fingerprint: match status {
                BuildStatus::Success => Some(Fingerprint::of_bytes(b"out")),
                BuildStatus::Failure => None,
            },
            last_build_status: status,
            dependency_snapshot: deps,
            failure: match status {
                BuildStatus::Success => None,
                BuildStatus::Failure => Some(UnitFailure::new(FailureKind::Render, "boom")),
            },
            artifact_count: 1,
            built_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_creates_db() {
        let path = temp_db_path();
        let _storage = Storage::open(&path).await.expect("open");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let path = temp_db_path();
        let s1 = Storage::open(&path).await.expect("first open");
        drop(s1);
        let _s2 = Storage::open(&path).await.expect("second open");
    }

    #[tokio::test]
    async fn commit_get_replace() {
        let storage = test_storage().await;
        let id = UnitId::from("pkg.mod");
        assert!(storage.get(&id).await.unwrap().is_none());

        let first = record("pkg.mod", BuildStatus::Success);
        storage.commit(&first).await.expect("commit");
        assert_eq!(storage.get(&id).await.unwrap(), Some(first));

        let second = record("pkg.mod", BuildStatus::Failure);
        storage.commit(&second).await.expect("replace");
        let loaded = storage.get(&id).await.unwrap().expect("record");
        assert!(loaded.is_failure());
        assert!(loaded.output_fingerprint.is_none());

        storage.remove(&id).await.expect("remove");
        assert!(storage.get(&id).await.unwrap().is_none());
        // Removing twice is fine.
        storage.remove(&id).await.expect("remove again");
    }

    #[tokio::test]
    async fn damaged_record_degrades_only_that_unit() {
        let storage = test_storage().await;
        storage
            .commit(&record("pkg.good", BuildStatus::Success))
            .await
            .unwrap();
        let bad = record("pkg.bad", BuildStatus::Success);
        let json = serde_json::to_string(&bad).unwrap();
        storage
            .write_raw("pkg.bad", &json, "0000not-the-checksum")
            .await
            .unwrap();
        storage
            .write_raw("pkg.garbled", "{not json", &Fingerprint::of_bytes(b"{not json").to_string())
            .await
            .unwrap();

        let snapshot = storage.load_all().await.expect("load");
        assert_eq!(snapshot.records.len(), 1);
        assert!(snapshot.records.contains_key(&UnitId::from("pkg.good")));
        assert_eq!(
            snapshot.corrupt,
            vec![UnitId::from("pkg.bad"), UnitId::from("pkg.garbled")]
        );
        assert!(!snapshot.reset);
        assert!(storage.get(&UnitId::from("pkg.bad")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_keyed_under_wrong_id_is_damaged() {
        let storage = test_storage().await;
        let other = record("pkg.other", BuildStatus::Success);
        let json = serde_json::to_string(&other).unwrap();
        let checksum = Fingerprint::of_bytes(json.as_bytes()).to_string();
        storage.write_raw("pkg.mine", &json, &checksum).await.unwrap();

        let snapshot = storage.load_all().await.unwrap();
        assert_eq!(snapshot.corrupt, vec![UnitId::from("pkg.mine")]);
    }

    #[tokio::test]
    async fn unreadable_file_is_moved_aside() {
        let path = temp_db_path();
        std::fs::write(&path, b"this is definitely not a sqlite database file, just text")
            .unwrap();

        let storage = Storage::open_or_recover(&path).await.expect("recover");
        assert!(storage.recovered());
        let snapshot = storage.load_all().await.unwrap();
        assert!(snapshot.reset);
        assert!(snapshot.records.is_empty());

        storage
            .commit(&record("pkg.fresh", BuildStatus::Success))
            .await
            .expect("fresh store is writable");
    }

    #[tokio::test]
    async fn run_history_and_stats() {
        let storage = test_storage().await;
        assert!(storage.last_full_build().await.unwrap().is_none());

        storage
            .commit(&record("pkg.a", BuildStatus::Success))
            .await
            .unwrap();
        storage
            .commit(&record("pkg.b", BuildStatus::Failure))
            .await
            .unwrap();

        let full = RunSummary {
            rebuilt: 1,
            failed: 1,
            full_build: true,
            ..RunSummary::default()
        };
        storage.record_run(&full).await.unwrap();
        storage
            .record_run(&RunSummary {
                skipped_cached: 2,
                ..RunSummary::default()
            })
            .await
            .unwrap();

        assert!(storage.last_full_build().await.unwrap().is_some());

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.tracked_units, 2);
        assert_eq!(stats.failed_units, vec![UnitId::from("pkg.b")]);
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.last_run.map(|r| r.skipped_cached), Some(2));

        storage.clear().await.unwrap();
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.tracked_units, 0);
        assert_eq!(stats.runs, 0);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let path = temp_db_path();
        let rw = Storage::open(&path).await.unwrap();
        rw.commit(&record("pkg.a", BuildStatus::Success)).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&path).await.unwrap();
        assert_eq!(ro.load_all().await.unwrap().records.len(), 1);
        let result = ro.commit(&record("pkg.b", BuildStatus::Success)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
