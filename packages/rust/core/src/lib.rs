//! Incremental documentation build engine for DocVault.
//!
//! Given the current source units and the fingerprint store, the engine
//! decides which units must be re-rendered, schedules that work under worker
//! and memory limits, and commits the results so an unchanged tree never
//! renders twice.
//!
//! Pipeline: [`detect`] → [`plan`] → [`scheduler`] (running [`executor`]) →
//! aggregation, driven by [`BuildEngine::build`].

mod aggregate;
pub mod cancel;
pub mod collab;
pub mod detect;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod plan;
pub mod progress;
pub mod report;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use collab::{ArtifactVault, DocRenderer, SourceScanner};
pub use detect::{ChangeSet, DirtyReason, detect_changes};
pub use engine::{BuildEngine, BuildRequest};
pub use graph::DependencyGraph;
pub use plan::{BuildPlan, Task, TaskKind, plan_build};
pub use progress::{ProgressReporter, SilentProgress};
pub use report::{BuildOutcome, BuildReport, FailedUnit, SkipReason, SkippedUnit};
pub use scheduler::{TaskOutcome, TaskResult};
