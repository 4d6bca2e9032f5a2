//! Collaborator contracts consumed by the build engine.
//!
//! Source analysis, rendering and vault layout live outside the engine. The
//! engine only sees these narrow, synchronous interfaces and calls them from
//! blocking worker threads.

use docvault_shared::{Artifact, Result, SourceUnit, UnitError, UnitId};

/// Enumerates the current source units.
pub trait SourceScanner: Send + Sync {
    /// Must return the same units, in the same order, for an unchanged tree.
    fn scan_sources(&self) -> Result<Vec<SourceUnit>>;
}

/// Turns one source unit into documentation artifacts.
pub trait DocRenderer: Send + Sync {
    fn analyze_and_render(
        &self,
        unit: &SourceUnit,
    ) -> std::result::Result<Vec<Artifact>, UnitError>;
}

/// Owns the on-disk layout of rendered documentation.
pub trait ArtifactVault: Send + Sync {
    /// Replace everything previously written for `unit_id` with `artifacts`.
    fn write_artifacts(&self, unit_id: &UnitId, artifacts: &[Artifact]) -> Result<()>;

    /// Remove everything written for `unit_id`. Unknown ids are not an error.
    fn delete_artifacts(&self, unit_id: &UnitId) -> Result<()>;
}
