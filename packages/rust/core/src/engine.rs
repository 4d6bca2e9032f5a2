//! The build entry point: scan, detect, plan, execute, aggregate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use docvault_shared::{
    BuildConfig, DocVaultError, FingerprintStore, Result, SourceUnit, StoreSnapshot, UnitId,
};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::aggregate::Aggregator;
use crate::cancel::CancelToken;
use crate::collab::{ArtifactVault, DocRenderer, SourceScanner};
use crate::detect::detect_changes;
use crate::executor::Executor;
use crate::graph::DependencyGraph;
use crate::plan::plan_build;
use crate::progress::ProgressReporter;
use crate::report::BuildReport;
use crate::scheduler::Scheduler;

/// What one invocation should build.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Restrict the build to these units plus their dependents. `None`
    /// builds the whole project.
    pub targets: Option<Vec<UnitId>>,
    /// Treat every in-scope unit as dirty.
    pub force: bool,
}

impl BuildRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn targets(ids: impl IntoIterator<Item = UnitId>) -> Self {
        Self {
            targets: Some(ids.into_iter().collect()),
            force: false,
        }
    }
}

/// Incremental documentation build engine.
///
/// Owns its fingerprint store; collaborators are shared so they can be
/// called from blocking worker threads.
pub struct BuildEngine<S> {
    store: S,
    scanner: Arc<dyn SourceScanner>,
    renderer: Arc<dyn DocRenderer>,
    vault: Arc<dyn ArtifactVault>,
    config: BuildConfig,
    store_recovered: bool,
}

impl<S: FingerprintStore> BuildEngine<S> {
    pub fn new(
        store: S,
        scanner: Arc<dyn SourceScanner>,
        renderer: Arc<dyn DocRenderer>,
        vault: Arc<dyn ArtifactVault>,
        config: BuildConfig,
    ) -> Self {
        Self {
            store,
            scanner,
            renderer,
            vault,
            config,
            store_recovered: false,
        }
    }

    /// Note that the store was rebuilt from scratch when it was opened.
    pub fn with_recovered_store(mut self, recovered: bool) -> Self {
        self.store_recovered = recovered;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Bring the vault up to date with the current sources.
    ///
    /// Unit-level failures are reported, never returned as errors. An `Err`
    /// means the invocation itself could not proceed: invalid configuration,
    /// an unknown target, a failed scan or a store write error.
    #[instrument(skip_all, fields(targeted = request.targets.is_some(), force = request.force))]
    pub async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<BuildReport> {
        self.config.validate()?;
        let started_at = Utc::now();
        let clock = Instant::now();

        // --- Scan ---
        progress.phase("Scanning sources");
        let units = self.scan().await?;
        let by_id = index_units(&units)?;

        // --- Snapshot ---
        let snapshot = match self.store.load_all().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "fingerprint store unreadable; starting from an empty cache");
                StoreSnapshot {
                    reset: true,
                    ..StoreSnapshot::default()
                }
            }
        };
        if !snapshot.corrupt.is_empty() {
            warn!(
                count = snapshot.corrupt.len(),
                "damaged fingerprint records ignored"
            );
        }

        // --- Detect & plan ---
        progress.phase("Planning");
        let graph = DependencyGraph::from_units(&units);
        let force = request.force || self.full_build_due(request).await;
        let changes = detect_changes(&units, &graph, &snapshot, force);
        let plan = plan_build(
            &units,
            &graph,
            &changes,
            request.targets.as_deref(),
            &self.config,
        )?;
        progress.planned(plan.tasks.len(), plan.cached.len());

        // --- Execute & aggregate ---
        progress.phase("Building");
        let executor = Arc::new(Executor::new(
            Arc::clone(&self.renderer),
            Arc::clone(&self.vault),
            self.config.task_timeout,
        ));
        let scheduler = Scheduler::new(executor, self.config.workers, self.config.memory_budget);
        let aggregator = Aggregator::new(&self.store, &graph, &by_id, &snapshot);
        let (tx, rx) = mpsc::unbounded_channel();
        let (stats, aggregated) = tokio::join!(
            scheduler.run(&plan, &by_id, cancel, tx, progress),
            aggregator.run(rx, cancel),
        );
        let aggregated = aggregated?;

        let report = BuildReport {
            started_at,
            wall_time: clock.elapsed(),
            rebuilt: aggregated.rebuilt,
            skipped_cached: plan.cached.len(),
            failed: aggregated.failures.len(),
            skipped: aggregated.skipped.len(),
            deleted: aggregated.deleted,
            failures: aggregated.failures,
            skipped_units: aggregated.skipped,
            cycles: plan.cycles,
            corrupt_records: snapshot.corrupt,
            store_recovered: self.store_recovered || snapshot.reset,
            peak_admitted_memory: stats.peak_admitted_memory,
            cancelled: stats.cancelled,
            full_build: request.targets.is_none() && plan.cached.is_empty() && !stats.cancelled,
        };

        if let Err(e) = self.store.record_run(&report.summary()).await {
            warn!(error = %e, "failed to record build history");
        }

        info!(
            rebuilt = report.rebuilt,
            cached = report.skipped_cached,
            failed = report.failed,
            skipped = report.skipped,
            deleted = report.deleted,
            cancelled = report.cancelled,
            elapsed_ms = report.wall_time.as_millis() as u64,
            "build finished"
        );
        progress.done(&report);
        Ok(report)
    }

    async fn scan(&self) -> Result<Vec<SourceUnit>> {
        let scanner = Arc::clone(&self.scanner);
        tokio::task::spawn_blocking(move || scanner.scan_sources())
            .await
            .map_err(|e| DocVaultError::validation(format!("source scan aborted: {e}")))?
    }

    /// Whether the configured full-rebuild interval has elapsed.
    async fn full_build_due(&self, request: &BuildRequest) -> bool {
        let Some(max_age) = self.config.force_full_after else {
            return false;
        };
        if request.targets.is_some() {
            return false;
        }
        match self.store.last_full_build().await {
            Ok(Some(at)) => {
                let due = (Utc::now() - at).to_std().is_ok_and(|age| age > max_age);
                if due {
                    info!(last_full_build = %at, "full rebuild interval elapsed");
                }
                due
            }
            Ok(None) => {
                info!("no previous full build; rebuilding everything");
                true
            }
            Err(e) => {
                warn!(error = %e, "could not read build history");
                false
            }
        }
    }
}

fn index_units(units: &[SourceUnit]) -> Result<BTreeMap<UnitId, SourceUnit>> {
    let mut by_id = BTreeMap::new();
    for unit in units {
        if by_id.insert(unit.id.clone(), unit.clone()).is_some() {
            return Err(DocVaultError::validation(format!(
                "duplicate unit id {} (at {})",
                unit.id,
                unit.path.display()
            )));
        }
    }
    Ok(by_id)
}
