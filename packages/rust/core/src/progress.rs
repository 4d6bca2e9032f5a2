//! Build progress callbacks.

use docvault_shared::UnitId;

use crate::report::BuildReport;
use crate::scheduler::TaskResult;

/// Progress callback for reporting build status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once the plan is known.
    fn planned(&self, tasks: usize, cached: usize);
    /// Called when a task reaches a terminal state.
    fn unit_finished(
        &self,
        unit_id: &UnitId,
        result: &TaskResult,
        completed: usize,
        total: usize,
    );
    /// Called when the build completes.
    fn done(&self, report: &BuildReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn planned(&self, _tasks: usize, _cached: usize) {}
    fn unit_finished(
        &self,
        _unit_id: &UnitId,
        _result: &TaskResult,
        _completed: usize,
        _total: usize,
    ) {
    }
    fn done(&self, _report: &BuildReport) {}
}
