//! Task dispatch under worker and memory limits.
//!
//! A single async loop owns every task's state. Work runs on spawned tokio
//! tasks (which push the collaborator calls onto the blocking pool) and
//! reports back over an mpsc channel, so no task state is shared.
//!
//! Lifecycle: `Pending -> Ready -> Dispatched -> {Succeeded, Failed, Skipped}`.
//! Ready tasks are ordered by descending memory estimate, then unit id. A
//! ready task is admitted only while fewer than `workers` tasks are in flight
//! and its estimate fits the remaining budget; if the head does not fit,
//! nothing behind it is admitted until memory frees up.
//!
//! A task's result and the release of its slot are separate messages. They
//! coincide except after a render timeout, where the slot stays taken until
//! the abandoned render thread returns.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;

use docvault_shared::{FailureKind, Fingerprint, SourceUnit, UnitFailure, UnitId};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::executor::{Executed, Execution, Executor};
use crate::plan::{BuildPlan, Task, TaskKind};
use crate::progress::ProgressReporter;
use crate::report::SkipReason;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal result of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded {
        output: Fingerprint,
        artifact_count: usize,
    },
    Deleted,
    Failed(UnitFailure),
    Skipped {
        reason: SkipReason,
        upstream: Option<UnitId>,
    },
}

/// Message sent to the result aggregator.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub unit_id: UnitId,
    pub kind: TaskKind,
    pub result: TaskResult,
}

/// What the scheduler observed while running a plan.
#[derive(Debug, Clone, Default)]
pub struct ScheduleStats {
    /// Peak summed estimate of tasks holding a slot, stragglers included.
    pub peak_admitted_memory: u64,
    pub dispatched: usize,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Message from a spawned task back to the scheduling loop.
enum Completion {
    Finished(UnitId, TaskResult),
    /// The task's worker slot and memory estimate are free again.
    Released(UnitId),
}

fn task_result(result: Result<Executed, UnitFailure>) -> TaskResult {
    match result {
        Ok(Executed::Rendered {
            output,
            artifact_count,
        }) => TaskResult::Succeeded {
            output,
            artifact_count,
        },
        Ok(Executed::Deleted) => TaskResult::Deleted,
        Err(failure) => TaskResult::Failed(failure),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Ready,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

/// Ready queue entry: larger memory first, then smaller id.
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    memory: u64,
    id: Reverse<UnitId>,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.memory
            .cmp(&other.memory)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct RunState<'a> {
    plan: &'a BuildPlan,
    state: BTreeMap<UnitId, TaskState>,
    /// Unsatisfied required inputs per task.
    waiting_on: BTreeMap<UnitId, usize>,
    /// Tasks that list the key among their required inputs.
    dependents: BTreeMap<UnitId, Vec<UnitId>>,
    ready: BinaryHeap<ReadyEntry>,
    outcomes: mpsc::UnboundedSender<TaskOutcome>,
    progress: &'a dyn ProgressReporter,
    completed: usize,
}

impl<'a> RunState<'a> {
    fn new(
        plan: &'a BuildPlan,
        outcomes: mpsc::UnboundedSender<TaskOutcome>,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        let mut dependents: BTreeMap<UnitId, Vec<UnitId>> = BTreeMap::new();
        let mut waiting_on = BTreeMap::new();
        for task in plan.tasks.values() {
            let inputs: Vec<&UnitId> = task
                .required_inputs
                .iter()
                .filter(|id| plan.tasks.contains_key(*id))
                .collect();
            for input in &inputs {
                dependents
                    .entry((*input).clone())
                    .or_default()
                    .push(task.unit_id.clone());
            }
            waiting_on.insert(task.unit_id.clone(), inputs.len());
        }
        Self {
            plan,
            state: plan
                .tasks
                .keys()
                .map(|id| (id.clone(), TaskState::Pending))
                .collect(),
            waiting_on,
            dependents,
            ready: BinaryHeap::new(),
            outcomes,
            progress,
            completed: 0,
        }
    }

    fn state_of(&self, id: &UnitId) -> TaskState {
        self.state.get(id).copied().unwrap_or(TaskState::Skipped)
    }

    fn mark_ready(&mut self, id: &UnitId) {
        if let Some(task) = self.plan.tasks.get(id) {
            self.state.insert(id.clone(), TaskState::Ready);
            self.ready.push(ReadyEntry {
                memory: task.estimated_memory,
                id: Reverse(id.clone()),
            });
        }
    }

    /// Head of the ready queue, discarding stale entries.
    fn peek_ready(&mut self) -> Option<&'a Task> {
        let plan = self.plan;
        while let Some(entry) = self.ready.peek() {
            if self.state_of(&entry.id.0) == TaskState::Ready {
                return plan.tasks.get(&entry.id.0);
            }
            self.ready.pop();
        }
        None
    }

    fn finish(&mut self, id: &UnitId, result: TaskResult) {
        let state = match &result {
            TaskResult::Succeeded { .. } | TaskResult::Deleted => TaskState::Succeeded,
            TaskResult::Failed(_) => TaskState::Failed,
            TaskResult::Skipped { .. } => TaskState::Skipped,
        };
        self.state.insert(id.clone(), state);
        self.completed += 1;
        self.progress
            .unit_finished(id, &result, self.completed, self.plan.tasks.len());

        let kind = self
            .plan
            .tasks
            .get(id)
            .map(|t| t.kind)
            .unwrap_or(TaskKind::Render);
        // The aggregator only goes away when the invocation is aborting.
        let _ = self.outcomes.send(TaskOutcome {
            unit_id: id.clone(),
            kind,
            result,
        });

        match state {
            TaskState::Succeeded => self.release_dependents(id),
            TaskState::Failed => self.skip_dependents(id),
            _ => {}
        }
    }

    fn release_dependents(&mut self, id: &UnitId) {
        let Some(dependents) = self.dependents.get(id).cloned() else {
            return;
        };
        for dependent in dependents {
            if let Some(count) = self.waiting_on.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 && self.state_of(&dependent) == TaskState::Pending {
                    self.mark_ready(&dependent);
                }
            }
        }
    }

    /// Mark every waiting task downstream of `failed` as skipped.
    fn skip_dependents(&mut self, failed: &UnitId) {
        let mut queue: VecDeque<UnitId> = self
            .dependents
            .get(failed)
            .cloned()
            .unwrap_or_default()
            .into();
        while let Some(id) = queue.pop_front() {
            if !self.state_of(&id).is_waiting() {
                continue;
            }
            debug!(unit = %id, upstream = %failed, "skipped after upstream failure");
            self.finish(
                &id,
                TaskResult::Skipped {
                    reason: SkipReason::UpstreamFailure,
                    upstream: Some(failed.clone()),
                },
            );
            if let Some(next) = self.dependents.get(&id) {
                queue.extend(next.iter().cloned());
            }
        }
    }

    fn cancel_waiting(&mut self) {
        let waiting: Vec<UnitId> = self
            .state
            .iter()
            .filter(|(_, s)| s.is_waiting())
            .map(|(id, _)| id.clone())
            .collect();
        for id in waiting {
            self.finish(
                &id,
                TaskResult::Skipped {
                    reason: SkipReason::Cancelled,
                    upstream: None,
                },
            );
        }
        self.ready.clear();
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    executor: Arc<Executor>,
    workers: usize,
    memory_budget: u64,
}

impl Scheduler {
    pub fn new(executor: Arc<Executor>, workers: usize, memory_budget: u64) -> Self {
        Self {
            executor,
            workers: workers.max(1),
            memory_budget,
        }
    }

    /// Run every task in `plan`, streaming terminal outcomes to `outcomes`.
    ///
    /// Returns once no task is in flight and none can be admitted. The
    /// sender is dropped on return, which closes the aggregator's stream.
    #[instrument(skip_all, fields(tasks = plan.tasks.len(), workers = self.workers))]
    pub async fn run(
        &self,
        plan: &BuildPlan,
        units: &BTreeMap<UnitId, SourceUnit>,
        cancel: &CancelToken,
        outcomes: mpsc::UnboundedSender<TaskOutcome>,
        progress: &dyn ProgressReporter,
    ) -> ScheduleStats {
        let mut run = RunState::new(plan, outcomes, progress);
        let mut stats = ScheduleStats::default();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut dispatched: HashSet<UnitId> = HashSet::new();
        let mut in_flight = 0usize;
        let mut in_use = 0u64;

        // Oversized tasks can never be admitted: fail them up front.
        for task in plan.tasks.values() {
            if task.estimated_memory > self.memory_budget
                && run.state_of(&task.unit_id).is_waiting()
            {
                warn!(
                    unit = %task.unit_id,
                    estimate = task.estimated_memory,
                    budget = self.memory_budget,
                    "memory estimate exceeds budget"
                );
                run.finish(
                    &task.unit_id,
                    TaskResult::Failed(UnitFailure::new(
                        FailureKind::ResourceExhaustion,
                        format!(
                            "estimated {} bytes exceeds the {} byte budget",
                            task.estimated_memory, self.memory_budget
                        ),
                    )),
                );
            }
        }
        let initial: Vec<UnitId> = plan
            .tasks
            .keys()
            .filter(|id| run.state_of(id) == TaskState::Pending && run.waiting_on[*id] == 0)
            .cloned()
            .collect();
        for id in &initial {
            run.mark_ready(id);
        }

        loop {
            if !stats.cancelled && cancel.is_cancelled() {
                info!(in_flight, "cancellation requested; no further tasks admitted");
                stats.cancelled = true;
                run.cancel_waiting();
            }

            // --- Admission ---
            while !stats.cancelled && in_flight < self.workers {
                let Some(task) = run.peek_ready() else {
                    break;
                };
                if in_use + task.estimated_memory > self.memory_budget {
                    debug!(unit = %task.unit_id, in_use, "head task waits for memory");
                    break;
                }
                let task = task.clone();
                run.ready.pop();

                if !dispatched.insert(task.unit_id.clone()) {
                    // Unreachable by construction: each id has one state entry.
                    warn!(unit = %task.unit_id, "refusing second dispatch");
                    continue;
                }
                run.state.insert(task.unit_id.clone(), TaskState::Dispatched);
                in_flight += 1;
                in_use += task.estimated_memory;
                stats.peak_admitted_memory = stats.peak_admitted_memory.max(in_use);
                stats.dispatched += 1;

                let executor = Arc::clone(&self.executor);
                let unit = units.get(&task.unit_id).cloned();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let Execution { result, straggler } = executor.execute(&task, unit).await;
                    let _ = done.send(Completion::Finished(
                        task.unit_id.clone(),
                        task_result(result),
                    ));
                    if let Some(handle) = straggler {
                        let _ = handle.await;
                        debug!(unit = %task.unit_id, "timed-out render thread returned");
                    }
                    let _ = done.send(Completion::Released(task.unit_id));
                });
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(completion) = done_rx.recv() => match completion {
                    Completion::Finished(id, result) => {
                        if let TaskResult::Failed(failure) = &result {
                            warn!(unit = %id, kind = %failure.kind, error = %failure.message, "unit failed");
                        }
                        run.finish(&id, result);
                    }
                    Completion::Released(id) => {
                        in_flight -= 1;
                        in_use -= plan.tasks.get(&id).map_or(0, |t| t.estimated_memory);
                    }
                },
                _ = cancel.cancelled(), if !stats.cancelled => {}
            }
        }

        let stranded = run.state.values().filter(|s| s.is_waiting()).count();
        if stranded > 0 {
            warn!(stranded, "tasks left unscheduled");
        }
        info!(
            dispatched = stats.dispatched,
            peak_admitted_memory = stats.peak_admitted_memory,
            cancelled = stats.cancelled,
            "scheduling finished"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::plan::TaskKind;
    use crate::progress::SilentProgress;
    use crate::testing::{FakeRenderer, FakeVault, unit};

    fn task(id: &str, memory: u64, inputs: &[&str]) -> Task {
        Task {
            unit_id: UnitId::from(id),
            kind: TaskKind::Render,
            required_inputs: inputs.iter().map(|i| UnitId::from(*i)).collect(),
            estimated_memory: memory,
        }
    }

    fn plan(tasks: Vec<Task>) -> BuildPlan {
        BuildPlan {
            tasks: tasks.into_iter().map(|t| (t.unit_id.clone(), t)).collect(),
            ..BuildPlan::default()
        }
    }

    fn units_for(plan: &BuildPlan) -> BTreeMap<UnitId, SourceUnit> {
        plan.tasks
            .keys()
            .map(|id| (id.clone(), unit(id.as_str(), id.as_str(), &[])))
            .collect()
    }

    async fn run(
        plan: &BuildPlan,
        renderer: Arc<FakeRenderer>,
        workers: usize,
        budget: u64,
        cancel: &CancelToken,
    ) -> (ScheduleStats, Vec<TaskOutcome>) {
        run_with_timeout(plan, renderer, workers, budget, cancel, Duration::from_secs(5)).await
    }

    async fn run_with_timeout(
        plan: &BuildPlan,
        renderer: Arc<FakeRenderer>,
        workers: usize,
        budget: u64,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> (ScheduleStats, Vec<TaskOutcome>) {
        let executor = Arc::new(Executor::new(
            renderer,
            Arc::new(FakeVault::default()),
            timeout,
        ));
        let scheduler = Scheduler::new(executor, workers, budget);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stats = scheduler
            .run(plan, &units_for(plan), cancel, tx, &SilentProgress)
            .await;
        let mut outcomes = Vec::new();
        while let Some(o) = rx.recv().await {
            outcomes.push(o);
        }
        (stats, outcomes)
    }

    fn result_of<'a>(outcomes: &'a [TaskOutcome], id: &str) -> &'a TaskResult {
        &outcomes
            .iter()
            .find(|o| o.unit_id.as_str() == id)
            .expect("outcome present")
            .result
    }

    #[test]
    fn ready_order_prefers_memory_then_id() {
        let mut heap = BinaryHeap::new();
        for (id, memory) in [("b", 5), ("a", 5), ("c", 9), ("d", 1)] {
            heap.push(ReadyEntry {
                memory,
                id: Reverse(UnitId::from(id)),
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.id.0.to_string())
            .collect();
        assert_eq!(order, vec!["c", "a", "b", "d"]);
    }

    #[tokio::test]
    async fn single_worker_dispatches_in_priority_order() {
        let p = plan(vec![
            task("small", 1, &[]),
            task("big", 30, &[]),
            task("mid", 20, &[]),
            task("after_small", 50, &["small"]),
        ]);
        let renderer = Arc::new(FakeRenderer::default());
        let (stats, outcomes) = run(&p, renderer.clone(), 1, 100, &CancelToken::new()).await;

        let calls: Vec<String> = renderer.calls().iter().map(|c| c.to_string()).collect();
        assert_eq!(calls, vec!["big", "mid", "small", "after_small"]);
        assert_eq!(outcomes.len(), 4);
        assert_eq!(stats.dispatched, 4);
        assert_eq!(stats.peak_admitted_memory, 50);
    }

    #[tokio::test]
    async fn memory_budget_bounds_concurrency() {
        let p = plan((0..6).map(|i| task(&format!("u{i}"), 40, &[])).collect());
        let renderer = Arc::new(FakeRenderer::default());
        for i in 0..6 {
            renderer.delay(&format!("u{i}"), Duration::from_millis(20));
        }
        let (stats, outcomes) = run(&p, renderer.clone(), 8, 100, &CancelToken::new()).await;

        assert!(stats.peak_admitted_memory <= 100);
        assert!(renderer.max_active() <= 2);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.result, TaskResult::Succeeded { .. })));
    }

    #[tokio::test]
    async fn timed_out_render_keeps_its_slot_until_the_thread_returns() {
        let p = plan((0..3).map(|i| task(&format!("slow{i}"), 60, &[])).collect());
        let renderer = Arc::new(FakeRenderer::default());
        for i in 0..3 {
            renderer.delay(&format!("slow{i}"), Duration::from_millis(150));
        }
        let (stats, outcomes) = run_with_timeout(
            &p,
            renderer.clone(),
            1,
            100,
            &CancelToken::new(),
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(renderer.calls().len(), 3);
        assert_eq!(renderer.max_active(), 1, "renders overlapped");
        assert!(renderer.overlapping().is_empty());
        assert_eq!(stats.peak_admitted_memory, 60);
        for i in 0..3 {
            assert!(matches!(
                result_of(&outcomes, &format!("slow{i}")),
                TaskResult::Failed(f) if f.kind == FailureKind::Render && f.message.contains("timed out")
            ));
        }
    }

    #[tokio::test]
    async fn timed_out_render_holds_memory_against_other_workers() {
        let p = plan(vec![task("a", 60, &[]), task("b", 60, &[])]);
        let renderer = Arc::new(FakeRenderer::default());
        renderer.delay("a", Duration::from_millis(150));
        renderer.delay("b", Duration::from_millis(150));
        let (stats, outcomes) = run_with_timeout(
            &p,
            renderer.clone(),
            4,
            100,
            &CancelToken::new(),
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(renderer.max_active(), 1);
        assert!(stats.peak_admitted_memory <= 100);
    }

    #[tokio::test]
    async fn oversized_task_fails_and_cascades() {
        let p = plan(vec![
            task("huge", 500, &[]),
            task("needs_huge", 1, &["huge"]),
            task("fine", 1, &[]),
        ]);
        let renderer = Arc::new(FakeRenderer::default());
        let (_, outcomes) = run(&p, renderer.clone(), 2, 100, &CancelToken::new()).await;

        assert!(matches!(
            result_of(&outcomes, "huge"),
            TaskResult::Failed(f) if f.kind == FailureKind::ResourceExhaustion
        ));
        assert_eq!(
            result_of(&outcomes, "needs_huge"),
            &TaskResult::Skipped {
                reason: SkipReason::UpstreamFailure,
                upstream: Some(UnitId::from("huge")),
            }
        );
        assert_eq!(renderer.calls(), vec![UnitId::from("fine")]);
    }

    #[tokio::test]
    async fn failure_skips_transitive_dependents_only() {
        let p = plan(vec![
            task("base", 1, &[]),
            task("mid", 1, &["base"]),
            task("top", 1, &["mid"]),
            task("side", 1, &[]),
        ]);
        let renderer = Arc::new(FakeRenderer::default());
        renderer.fail_analysis("base");
        let (_, outcomes) = run(&p, renderer.clone(), 4, 100, &CancelToken::new()).await;

        assert!(matches!(result_of(&outcomes, "base"), TaskResult::Failed(_)));
        for id in ["mid", "top"] {
            assert!(matches!(
                result_of(&outcomes, id),
                TaskResult::Skipped {
                    reason: SkipReason::UpstreamFailure,
                    ..
                }
            ));
        }
        assert!(matches!(
            result_of(&outcomes, "side"),
            TaskResult::Succeeded { .. }
        ));
        let called: BTreeSet<UnitId> = renderer.calls().into_iter().collect();
        assert!(!called.contains(&UnitId::from("mid")));
    }

    #[tokio::test]
    async fn cancellation_skips_waiting_and_drains_in_flight() {
        let p = plan(vec![
            task("first", 1, &[]),
            task("second", 1, &["first"]),
            task("third", 1, &["second"]),
        ]);
        let renderer = Arc::new(FakeRenderer::default());
        renderer.delay("first", Duration::from_millis(100));
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let (stats, outcomes) = run(&p, renderer.clone(), 2, 100, &cancel).await;
        assert!(stats.cancelled);
        assert!(matches!(
            result_of(&outcomes, "first"),
            TaskResult::Succeeded { .. }
        ));
        for id in ["second", "third"] {
            assert_eq!(
                result_of(&outcomes, id),
                &TaskResult::Skipped {
                    reason: SkipReason::Cancelled,
                    upstream: None,
                }
            );
        }
        assert_eq!(renderer.calls(), vec![UnitId::from("first")]);
    }
}
