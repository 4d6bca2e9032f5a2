//! Result aggregation: the only writer of fingerprint records.

use std::collections::BTreeMap;

use chrono::Utc;
use docvault_shared::{
    BuildStatus, DocVaultError, Fingerprint, FingerprintRecord, FingerprintStore,
    RECORD_SCHEMA_VERSION, Result, SourceUnit, StoreSnapshot, UnitFailure, UnitId,
};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};

use crate::cancel::CancelToken;
use crate::graph::DependencyGraph;
use crate::plan::TaskKind;
use crate::report::{FailedUnit, SkippedUnit};
use crate::scheduler::{TaskOutcome, TaskResult};

/// Tallies collected from the outcome stream.
#[derive(Debug, Default)]
pub(crate) struct Aggregated {
    pub rebuilt: usize,
    pub deleted: usize,
    pub failures: Vec<FailedUnit>,
    pub skipped: Vec<SkippedUnit>,
}

pub(crate) struct Aggregator<'a, S> {
    store: &'a S,
    graph: &'a DependencyGraph,
    units: &'a BTreeMap<UnitId, SourceUnit>,
    /// Output fingerprint of every unit as of this moment in the build.
    outputs: BTreeMap<UnitId, Option<Fingerprint>>,
}

impl<'a, S: FingerprintStore> Aggregator<'a, S> {
    pub fn new(
        store: &'a S,
        graph: &'a DependencyGraph,
        units: &'a BTreeMap<UnitId, SourceUnit>,
        snapshot: &StoreSnapshot,
    ) -> Self {
        let outputs = snapshot
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.output_fingerprint.clone()))
            .collect();
        Self {
            store,
            graph,
            units,
            outputs,
        }
    }

    /// Consume outcomes until the scheduler closes the channel.
    ///
    /// A store write error cancels the build; the remaining outcomes are still
    /// drained so in-flight work settles, then the error is returned.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut outcomes: mpsc::UnboundedReceiver<TaskOutcome>,
        cancel: &CancelToken,
    ) -> Result<Aggregated> {
        let mut tally = Aggregated::default();
        let mut write_error: Option<DocVaultError> = None;

        while let Some(outcome) = outcomes.recv().await {
            if write_error.is_some() {
                continue;
            }
            if let Err(e) = self.apply(outcome, &mut tally).await {
                error!(error = %e, "fingerprint store write failed; cancelling build");
                cancel.cancel();
                write_error = Some(e);
            }
        }

        match write_error {
            Some(e) => Err(e),
            None => Ok(tally),
        }
    }

    async fn apply(&mut self, outcome: TaskOutcome, tally: &mut Aggregated) -> Result<()> {
        let TaskOutcome {
            unit_id,
            kind,
            result,
        } = outcome;
        match result {
            TaskResult::Succeeded {
                output,
                artifact_count,
            } => {
                let record = self.record(&unit_id, Some(output.clone()), None, artifact_count)?;
                self.store.commit(&record).await?;
                self.outputs.insert(unit_id.clone(), Some(output));
                tally.rebuilt += 1;
                debug!(unit = %unit_id, "record committed");
            }
            TaskResult::Deleted => {
                self.store.remove(&unit_id).await?;
                self.outputs.remove(&unit_id);
                tally.deleted += 1;
                debug!(unit = %unit_id, "record removed");
            }
            TaskResult::Failed(failure) => {
                // A failed deletion keeps its record so the next build retries it.
                if kind == TaskKind::Render {
                    let record = self.record(&unit_id, None, Some(failure.clone()), 0)?;
                    self.store.commit(&record).await?;
                    self.outputs.insert(unit_id.clone(), None);
                }
                tally.failures.push(FailedUnit { unit_id, failure });
            }
            TaskResult::Skipped { reason, upstream } => {
                tally.skipped.push(SkippedUnit {
                    unit_id,
                    reason,
                    upstream,
                });
            }
        }
        Ok(())
    }

    fn record(
        &self,
        unit_id: &UnitId,
        output: Option<Fingerprint>,
        failure: Option<UnitFailure>,
        artifact_count: usize,
    ) -> Result<FingerprintRecord> {
        let unit = self.units.get(unit_id).ok_or_else(|| {
            DocVaultError::validation(format!("outcome for unscanned unit {unit_id}"))
        })?;
        let dependency_snapshot = self
            .graph
            .dependencies_of(unit_id)
            .iter()
            .map(|dep| (dep.clone(), self.outputs.get(dep).cloned().flatten()))
            .collect();
        Ok(FingerprintRecord {
            schema_version: RECORD_SCHEMA_VERSION,
            unit_id: unit_id.clone(),
            input_fingerprint: unit.fingerprint.clone(),
            last_build_status: if failure.is_some() {
                BuildStatus::Failure
            } else {
                BuildStatus::Success
            },
            output_fingerprint: output,
            dependency_snapshot,
            failure,
            artifact_count,
            built_at: Utc::now(),
        })
    }
}
