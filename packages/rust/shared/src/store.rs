//! The fingerprint store contract.
//!
//! The store is passed explicitly to the build engine; there is no
//! process-wide instance. Implementations live in `docvault-storage`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{FingerprintRecord, StoreSnapshot, UnitId};

/// Aggregate counts persisted for one build invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub rebuilt: usize,
    pub skipped_cached: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub cancelled: bool,
    /// Whole project with every unit forced dirty.
    pub full_build: bool,
}

/// Summary used by the `status` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub tracked_units: usize,
    pub failed_units: Vec<UnitId>,
    pub corrupt_records: usize,
    pub runs: usize,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<RunSummary>,
    pub last_full_build: Option<DateTime<Utc>>,
}

/// Persistent mapping from unit identity to its last build fingerprints.
///
/// `commit` replaces a record atomically: a reader sees either the previous
/// record or the new one, never a mix.
#[allow(async_fn_in_trait)]
pub trait FingerprintStore {
    /// Read every record. Damaged entries are listed in `corrupt`, not returned.
    async fn load_all(&self) -> Result<StoreSnapshot>;

    /// Read one record; a damaged entry reads as absent.
    async fn get(&self, unit_id: &UnitId) -> Result<Option<FingerprintRecord>>;

    /// Atomically insert or replace the record for `record.unit_id`.
    async fn commit(&self, record: &FingerprintRecord) -> Result<()>;

    /// Remove a unit's record. Removing an unknown id is not an error.
    async fn remove(&self, unit_id: &UnitId) -> Result<()>;

    /// Append a build run to the history.
    async fn record_run(&self, summary: &RunSummary) -> Result<()>;

    /// When the last full build finished, if ever.
    async fn last_full_build(&self) -> Result<Option<DateTime<Utc>>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Drop every record and the run history.
    async fn clear(&self) -> Result<()>;
}
