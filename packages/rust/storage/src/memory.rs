//! In-memory fingerprint store.
//!
//! Records are kept in their serialized, checksummed form so damage can be
//! simulated and detected the same way as on disk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use docvault_shared::{
    DocVaultError, FingerprintRecord, FingerprintStore, Result, RunSummary, StoreSnapshot,
    StoreStats, UnitId,
};
use tokio::sync::Mutex;

use crate::decode_record;

#[derive(Default)]
struct Inner {
    /// unit id -> (record json, checksum)
    records: BTreeMap<UnitId, (String, String)>,
    runs: Vec<(DateTime<Utc>, RunSummary)>,
}

/// A [`FingerprintStore`] that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `commit` calls so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Damage the stored entry for `unit_id` so its checksum no longer matches.
    pub async fn corrupt(&self, unit_id: &UnitId) {
        let mut inner = self.inner.lock().await;
        if let Some((json, _)) = inner.records.get_mut(unit_id) {
            json.push_str("garbage");
        }
    }
}

impl FingerprintStore for MemoryStore {
    async fn load_all(&self) -> Result<StoreSnapshot> {
        let inner = self.inner.lock().await;
        let mut snapshot = StoreSnapshot::default();
        for (unit_id, (json, checksum)) in &inner.records {
            match decode_record(unit_id, json, checksum) {
                Some(record) => {
                    snapshot.records.insert(unit_id.clone(), record);
                }
                None => snapshot.corrupt.push(unit_id.clone()),
            }
        }
        Ok(snapshot)
    }

    async fn get(&self, unit_id: &UnitId) -> Result<Option<FingerprintRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(unit_id)
            .and_then(|(json, checksum)| decode_record(unit_id, json, checksum)))
    }

    async fn commit(&self, record: &FingerprintRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| DocVaultError::Storage(format!("encode record: {e}")))?;
        let checksum = record.checksum()?;
        self.inner
            .lock()
            .await
            .records
            .insert(record.unit_id.clone(), (json, checksum));
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, unit_id: &UnitId) -> Result<()> {
        self.inner.lock().await.records.remove(unit_id);
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<()> {
        self.inner
            .lock()
            .await
            .runs
            .push((Utc::now(), summary.clone()));
        Ok(())
    }

    async fn last_full_build(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .iter()
            .rev()
            .find(|(_, run)| run.full_build)
            .map(|(at, _)| *at))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let snapshot = self.load_all().await?;
        let inner = self.inner.lock().await;
        Ok(StoreStats {
            tracked_units: snapshot.records.len(),
            failed_units: snapshot
                .records
                .values()
                .filter(|r| r.is_failure())
                .map(|r| r.unit_id.clone())
                .collect(),
            corrupt_records: snapshot.corrupt.len(),
            runs: inner.runs.len(),
            last_run_at: inner.runs.last().map(|(at, _)| *at),
            last_run: inner.runs.last().map(|(_, run)| run.clone()),
            last_full_build: inner
                .runs
                .iter()
                .rev()
                .find(|(_, run)| run.full_build)
                .map(|(at, _)| *at),
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.records.clear();
        inner.runs.clear();
        Ok(())
    }
}
