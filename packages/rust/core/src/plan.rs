//! Build planning: scope, dirty expansion and task DAG construction.
//!
//! The plan is pure data. It decides *what* runs and in which dependency
//! order; the scheduler decides *when*.

use std::collections::{BTreeMap, BTreeSet};

use docvault_shared::{BuildConfig, DocVaultError, Result, SourceUnit, UnitId};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::detect::{ChangeSet, DirtyReason};
use crate::graph::DependencyGraph;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Analyze and render the unit's documentation.
    Render,
    /// Remove the artifacts and record of a unit that no longer exists.
    Delete,
}

/// One unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub unit_id: UnitId,
    pub kind: TaskKind,
    /// Tasks in this plan that must succeed before this one may run.
    pub required_inputs: BTreeSet<UnitId>,
    /// Working memory admitted against the budget while the task runs.
    pub estimated_memory: u64,
}

// ---------------------------------------------------------------------------
// BuildPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub tasks: BTreeMap<UnitId, Task>,
    /// Why each render task was scheduled.
    pub reasons: BTreeMap<UnitId, DirtyReason>,
    /// In-scope units whose cached output is reused.
    pub cached: BTreeSet<UnitId>,
    /// Cycles found in the dependency graph, canonicalized.
    pub cycles: Vec<Vec<UnitId>>,
    /// Tasks in dependency order, smallest id first among ready tasks.
    pub order: Vec<UnitId>,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn render_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.kind == TaskKind::Render)
            .count()
    }
}

/// Units a build request covers.
fn scope(graph: &DependencyGraph, targets: Option<&[UnitId]>) -> BTreeSet<UnitId> {
    match targets {
        None => graph.nodes().cloned().collect(),
        Some(targets) => {
            let seeds: BTreeSet<UnitId> = targets
                .iter()
                .filter(|id| graph.contains(id))
                .cloned()
                .collect();
            graph.dependency_closure(&graph.dependents_closure(&seeds))
        }
    }
}

/// Build the task DAG for one invocation.
///
/// Targets must each name a current unit or a deleted one; anything else is
/// [`DocVaultError::UnknownTarget`].
#[instrument(skip_all, fields(targeted = targets.is_some()))]
pub fn plan_build(
    units: &[SourceUnit],
    graph: &DependencyGraph,
    changes: &ChangeSet,
    targets: Option<&[UnitId]>,
    config: &BuildConfig,
) -> Result<BuildPlan> {
    if let Some(targets) = targets {
        if let Some(unknown) = targets
            .iter()
            .find(|id| !graph.contains(id) && !changes.deleted.contains(*id))
        {
            return Err(DocVaultError::UnknownTarget(unknown.clone()));
        }
    }

    let scope = scope(graph, targets);
    let mut plan = BuildPlan {
        cycles: graph.detect_cycles(),
        ..BuildPlan::default()
    };

    // --- Dirty set within scope ---
    let mut reasons: BTreeMap<UnitId, DirtyReason> = changes
        .dirty
        .iter()
        .filter(|(id, _)| scope.contains(*id))
        .map(|(id, reason)| (id.clone(), *reason))
        .collect();

    // --- Cycle fallback ---
    let groups: Vec<BTreeSet<UnitId>> = match graph.topological_order(&scope) {
        Ok(_) => Vec::new(),
        Err(DocVaultError::CyclicDependency { cycles }) => {
            warn!(
                cycles = cycles.len(),
                "dependency cycles in scope; cycle members rebuild in id order"
            );
            graph
                .cyclic_groups(&plan.cycles)
                .into_iter()
                .filter(|group| group.iter().any(|id| scope.contains(id)))
                .collect()
        }
        Err(e) => return Err(e),
    };
    for member in groups.iter().flatten() {
        reasons.entry(member.clone()).or_insert(DirtyReason::Cyclic);
    }

    // --- Expand to dependents ---
    let seeds: BTreeSet<UnitId> = reasons.keys().cloned().collect();
    for id in graph.dependents_closure(&seeds) {
        if scope.contains(&id) {
            reasons.entry(id).or_insert(DirtyReason::Upstream);
        }
    }

    // --- Render tasks ---
    let group_of: BTreeMap<&UnitId, usize> = groups
        .iter()
        .enumerate()
        .flat_map(|(i, group)| group.iter().map(move |id| (id, i)))
        .collect();
    let sizes: BTreeMap<&UnitId, u64> = units.iter().map(|u| (&u.id, u.size_bytes)).collect();

    for id in reasons.keys() {
        let own_group = group_of.get(id);
        let mut required: BTreeSet<UnitId> = graph
            .dependencies_of(id)
            .iter()
            .filter(|dep| reasons.contains_key(*dep))
            .filter_map(|dep| match group_of.get(dep) {
                // A cycle is done only once the last member of its chain is.
                Some(&group) if own_group != Some(&group) => groups[group].last().cloned(),
                Some(_) => None,
                None => Some(dep.clone()),
            })
            .collect();
        if let Some(&group) = own_group {
            // Inside a cycle, each member waits for the previous one by id.
            if let Some(prev) = groups[group].range(..id.clone()).next_back() {
                required.insert(prev.clone());
            }
        }
        let size = sizes.get(id).copied().unwrap_or(0);
        plan.tasks.insert(
            id.clone(),
            Task {
                unit_id: id.clone(),
                kind: TaskKind::Render,
                required_inputs: required,
                estimated_memory: size.saturating_mul(config.memory_per_source_byte),
            },
        );
    }

    // --- Delete tasks ---
    for id in &changes.deleted {
        let wanted = targets.is_none_or(|t| t.contains(id));
        if wanted {
            plan.tasks.insert(
                id.clone(),
                Task {
                    unit_id: id.clone(),
                    kind: TaskKind::Delete,
                    required_inputs: BTreeSet::new(),
                    estimated_memory: 0,
                },
            );
        }
    }

    plan.cached = scope
        .iter()
        .filter(|id| !reasons.contains_key(*id))
        .cloned()
        .collect();
    plan.reasons = reasons;
    plan.order = task_order(&plan.tasks)?;

    info!(
        scope = scope.len(),
        render = plan.render_count(),
        delete = plan.tasks.len() - plan.render_count(),
        cached = plan.cached.len(),
        cycles = plan.cycles.len(),
        "build planned"
    );
    Ok(plan)
}

/// Topological order of the task DAG itself. Cycles were condensed above,
/// so a failure here is an internal invariant violation.
fn task_order(tasks: &BTreeMap<UnitId, Task>) -> Result<Vec<UnitId>> {
    let mut dag = DependencyGraph::new();
    for id in tasks.keys() {
        dag.add_node(id.clone());
    }
    for task in tasks.values() {
        for input in &task.required_inputs {
            dag.add_edge(&task.unit_id, input);
        }
    }
    let all: BTreeSet<UnitId> = tasks.keys().cloned().collect();
    let order = dag.topological_order(&all)?;
    debug!(tasks = order.len(), "task order computed");
    Ok(order)
}
