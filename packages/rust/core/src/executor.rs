//! Runs a single task against the renderer and vault collaborators.

use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use docvault_shared::{Artifact, FailureKind, Fingerprint, SourceUnit, UnitError, UnitFailure};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::collab::{ArtifactVault, DocRenderer};
use crate::plan::{Task, TaskKind};

/// Successful result of executing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executed {
    Rendered {
        output: Fingerprint,
        artifact_count: usize,
    },
    Deleted,
}

type RenderHandle = JoinHandle<Result<Vec<Artifact>, UnitError>>;

/// One task attempt.
#[derive(Debug)]
pub struct Execution {
    pub result: Result<Executed, UnitFailure>,
    /// Render thread abandoned by a timeout. It cannot be stopped, so the
    /// caller must treat its worker slot and memory as taken until it returns.
    pub straggler: Option<RenderHandle>,
}

impl Execution {
    fn settled(result: Result<Executed, UnitFailure>) -> Self {
        Self {
            result,
            straggler: None,
        }
    }
}

/// Executes tasks on the blocking pool. Never fails the build; every
/// problem comes back as a classified [`UnitFailure`].
pub struct Executor {
    renderer: Arc<dyn DocRenderer>,
    vault: Arc<dyn ArtifactVault>,
    timeout: Duration,
}

impl Executor {
    pub fn new(
        renderer: Arc<dyn DocRenderer>,
        vault: Arc<dyn ArtifactVault>,
        timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            vault,
            timeout,
        }
    }

    /// Run one task. `unit` is required for render tasks.
    pub async fn execute(&self, task: &Task, unit: Option<SourceUnit>) -> Execution {
        match (task.kind, unit) {
            (TaskKind::Render, Some(unit)) => self.render(unit).await,
            (TaskKind::Render, None) => Execution::settled(Err(UnitFailure::new(
                FailureKind::Analysis,
                "unit missing from the current scan",
            ))),
            (TaskKind::Delete, _) => Execution::settled(self.delete(task).await),
        }
    }

    async fn render(&self, unit: SourceUnit) -> Execution {
        let renderer = Arc::clone(&self.renderer);
        let unit = Arc::new(unit);
        let render_unit = Arc::clone(&unit);
        let mut handle =
            tokio::task::spawn_blocking(move || renderer.analyze_and_render(&render_unit));

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => Execution::settled(self.store(&unit, joined).await),
            Err(_) => {
                warn!(
                    unit = %unit.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "render timed out"
                );
                // Whatever the thread eventually produces is discarded.
                Execution {
                    result: Err(UnitFailure::new(
                        FailureKind::Render,
                        format!("timed out after {:?}", self.timeout),
                    )),
                    straggler: Some(handle),
                }
            }
        }
    }

    async fn store(
        &self,
        unit: &Arc<SourceUnit>,
        joined: Result<Result<Vec<Artifact>, UnitError>, JoinError>,
    ) -> Result<Executed, UnitFailure> {
        let artifacts = match joined {
            Err(join) => {
                return Err(UnitFailure::new(
                    FailureKind::Render,
                    format!("renderer panicked: {join}"),
                ));
            }
            Ok(Err(unit_err)) => return Err(unit_err.into()),
            Ok(Ok(artifacts)) => artifacts,
        };

        validate_artifacts(&artifacts)?;
        let output = output_fingerprint(&artifacts);
        let artifact_count = artifacts.len();

        let vault = Arc::clone(&self.vault);
        let write_unit = Arc::clone(unit);
        tokio::task::spawn_blocking(move || vault.write_artifacts(&write_unit.id, &artifacts))
            .await
            .map_err(|e| vault_failure("write panicked", e))?
            .map_err(|e| vault_failure("write failed", e))?;

        debug!(unit = %unit.id, artifacts = artifact_count, output = %output.short(), "rendered");
        Ok(Executed::Rendered {
            output,
            artifact_count,
        })
    }

    async fn delete(&self, task: &Task) -> Result<Executed, UnitFailure> {
        let vault = Arc::clone(&self.vault);
        let unit_id = task.unit_id.clone();
        tokio::task::spawn_blocking(move || vault.delete_artifacts(&unit_id))
            .await
            .map_err(|e| vault_failure("delete panicked", e))?
            .map_err(|e| vault_failure("delete failed", e))?;
        debug!(unit = %task.unit_id, "artifacts deleted");
        Ok(Executed::Deleted)
    }
}

fn vault_failure(what: &str, err: impl std::fmt::Display) -> UnitFailure {
    UnitFailure::new(FailureKind::Render, format!("vault {what}: {err}"))
}

/// Every artifact path must be relative, stay inside the unit's directory and be unique.
fn validate_artifacts(artifacts: &[Artifact]) -> Result<(), UnitFailure> {
    let mut seen = BTreeSet::new();
    for artifact in artifacts {
        let path = &artifact.relative_path;
        if !is_contained(path) {
            return Err(UnitFailure::new(
                FailureKind::Render,
                format!("artifact path {} escapes the unit directory", path.display()),
            ));
        }
        if !seen.insert(path) {
            return Err(UnitFailure::new(
                FailureKind::Render,
                format!("duplicate artifact path {}", path.display()),
            ));
        }
    }
    Ok(())
}

fn is_contained(path: &Path) -> bool {
    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal > 0
}

/// SHA-256 over the artifact list sorted by path, independent of emit order.
pub fn output_fingerprint(artifacts: &[Artifact]) -> Fingerprint {
    let mut sorted: Vec<(String, &[u8])> = artifacts
        .iter()
        .map(|a| {
            (
                a.relative_path.to_string_lossy().replace('\\', "/"),
                a.contents.as_slice(),
            )
        })
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    Fingerprint::of_parts(
        sorted
            .iter()
            .flat_map(|(path, contents)| [path.as_bytes(), *contents]),
    )
}
