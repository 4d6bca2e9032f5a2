//! Change detection against the fingerprint store snapshot.

use std::collections::{BTreeMap, BTreeSet};

use docvault_shared::{SourceUnit, StoreSnapshot, UnitId};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::graph::DependencyGraph;

/// Why a unit needs rebuilding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyReason {
    /// No record exists for the unit.
    New,
    /// The unit's record failed verification.
    CorruptRecord,
    /// Source content fingerprint differs from the record.
    ContentChanged,
    /// The last build attempt failed.
    PreviouslyFailed,
    /// A dependency recorded at last build no longer exists.
    DependencyRemoved,
    /// A recorded dependency's output fingerprint moved.
    DependencyChanged,
    /// The unit now depends on a different set of units.
    DependenciesChanged,
    /// Rebuild requested regardless of cache state.
    Forced,
    /// Something the unit depends on is being rebuilt.
    Upstream,
    /// The unit sits on a dependency cycle.
    Cyclic,
}

/// Partition of `known ∪ present` unit ids.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub dirty: BTreeMap<UnitId, DirtyReason>,
    /// Known to the store but no longer present in the scan.
    pub deleted: BTreeSet<UnitId>,
    pub unchanged: BTreeSet<UnitId>,
}

impl ChangeSet {
    pub fn is_dirty(&self, id: &UnitId) -> bool {
        self.dirty.contains_key(id)
    }
}

/// Classify every unit as dirty, unchanged or deleted.
#[instrument(skip_all, fields(units = units.len(), force = force))]
pub fn detect_changes(
    units: &[SourceUnit],
    graph: &DependencyGraph,
    snapshot: &StoreSnapshot,
    force: bool,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let corrupt: BTreeSet<&UnitId> = snapshot.corrupt.iter().collect();

    for unit in units {
        match dirty_reason(unit, graph, snapshot, &corrupt, force) {
            Some(reason) => {
                debug!(unit = %unit.id, ?reason, "dirty");
                changes.dirty.insert(unit.id.clone(), reason);
            }
            None => {
                changes.unchanged.insert(unit.id.clone());
            }
        }
    }

    let present: BTreeSet<&UnitId> = units.iter().map(|u| &u.id).collect();
    changes.deleted = snapshot
        .records
        .keys()
        .chain(snapshot.corrupt.iter())
        .filter(|id| !present.contains(id))
        .cloned()
        .collect();

    info!(
        dirty = changes.dirty.len(),
        unchanged = changes.unchanged.len(),
        deleted = changes.deleted.len(),
        "changes detected"
    );
    changes
}

fn dirty_reason(
    unit: &SourceUnit,
    graph: &DependencyGraph,
    snapshot: &StoreSnapshot,
    corrupt: &BTreeSet<&UnitId>,
    force: bool,
) -> Option<DirtyReason> {
    if force {
        return Some(DirtyReason::Forced);
    }
    let Some(record) = snapshot.records.get(&unit.id) else {
        return Some(if corrupt.contains(&unit.id) {
            DirtyReason::CorruptRecord
        } else {
            DirtyReason::New
        });
    };
    if record.input_fingerprint != unit.fingerprint {
        return Some(DirtyReason::ContentChanged);
    }
    if record.is_failure() || record.output_fingerprint.is_none() {
        return Some(DirtyReason::PreviouslyFailed);
    }
    for (dep, recorded) in &record.dependency_snapshot {
        if !graph.contains(dep) {
            return Some(DirtyReason::DependencyRemoved);
        }
        if snapshot.output_of(dep) != recorded.as_ref() {
            return Some(DirtyReason::DependencyChanged);
        }
    }
    let current = graph.dependencies_of(&unit.id);
    if !current.iter().eq(record.dependency_snapshot.keys()) {
        return Some(DirtyReason::DependenciesChanged);
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use docvault_shared::{
        BuildStatus, FailureKind, Fingerprint, FingerprintRecord, RECORD_SCHEMA_VERSION,
        UnitFailure,
    };

    use super::*;

    fn unit(id: &str, content: &str, deps: &[&str]) -> SourceUnit {
        SourceUnit {
            id: UnitId::from(id),
            path: format!("{id}.py").into(),
            fingerprint: Fingerprint::of_bytes(content.as_bytes()),
            dependencies: deps.iter().map(|d| UnitId::from(*d)).collect(),
            size_bytes: content.len() as u64,
        }
    }

    fn output(id: &str) -> Fingerprint {
        Fingerprint::of_bytes(format!("out-{id}").as_bytes())
    }

    /// A record consistent with `unit` having just been built.
    fn built(unit: &SourceUnit, deps: &[&str]) -> FingerprintRecord {
        FingerprintRecord {
            schema_version: RECORD_SCHEMA_VERSION,
            unit_id: unit.id.clone(),
            input_fingerprint: unit.fingerprint.clone(),
            output_fingerprint: Some(output(unit.id.as_str())),
            last_build_status: BuildStatus::Success,
            dependency_snapshot: deps
                .iter()
                .map(|d| (UnitId::from(*d), Some(output(d))))
                .collect(),
            failure: None,
            artifact_count: 1,
            built_at: Utc::now(),
        }
    }

    fn snapshot(records: Vec<FingerprintRecord>) -> StoreSnapshot {
        StoreSnapshot {
            records: records.into_iter().map(|r| (r.unit_id.clone(), r)).collect(),
            ..StoreSnapshot::default()
        }
    }

    fn reason(changes: &ChangeSet, id: &str) -> Option<DirtyReason> {
        changes.dirty.get(&UnitId::from(id)).copied()
    }

    #[test]
    fn fully_cached_project_is_clean() {
        let units = vec![unit("a", "A", &[]), unit("b", "B", &["a", "json"])];
        let snap = snapshot(vec![built(&units[0], &[]), built(&units[1], &["a"])]);
        let graph = DependencyGraph::from_units(&units);

        let changes = detect_changes(&units, &graph, &snap, false);
        assert!(changes.dirty.is_empty());
        assert_eq!(changes.unchanged.len(), 2);
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn classifies_each_reason() {
        let units = vec![
            unit("new", "N", &[]),
            unit("edited", "E2", &[]),
            unit("failed", "F", &[]),
            unit("lost_dep", "L", &[]),
            unit("moved_dep", "M", &["base"]),
            unit("rewired", "R", &["base"]),
            unit("base", "B", &[]),
            unit("corrupt", "C", &[]),
        ];
        let mut failed = built(&units[2], &[]);
        failed.last_build_status = BuildStatus::Failure;
        failed.output_fingerprint = None;
        failed.failure = Some(UnitFailure::new(FailureKind::Render, "x"));

        let mut moved = built(&units[4], &["base"]);
        moved
            .dependency_snapshot
            .insert(UnitId::from("base"), Some(Fingerprint::of_bytes(b"stale")));

        let mut snap = snapshot(vec![
            built(&unit("edited", "E1", &[]), &[]),
            failed,
            built(&units[3], &["gone"]),
            moved,
            built(&units[5], &[]),
            built(&units[6], &[]),
        ]);
        snap.corrupt.push(UnitId::from("corrupt"));
        let graph = DependencyGraph::from_units(&units);

        let changes = detect_changes(&units, &graph, &snap, false);
        assert_eq!(reason(&changes, "new"), Some(DirtyReason::New));
        assert_eq!(reason(&changes, "edited"), Some(DirtyReason::ContentChanged));
        assert_eq!(reason(&changes, "failed"), Some(DirtyReason::PreviouslyFailed));
        assert_eq!(reason(&changes, "lost_dep"), Some(DirtyReason::DependencyRemoved));
        assert_eq!(reason(&changes, "moved_dep"), Some(DirtyReason::DependencyChanged));
        assert_eq!(reason(&changes, "rewired"), Some(DirtyReason::DependenciesChanged));
        assert_eq!(reason(&changes, "corrupt"), Some(DirtyReason::CorruptRecord));
        assert_eq!(changes.unchanged, BTreeSet::from([UnitId::from("base")]));
    }

    #[test]
    fn missing_units_are_deleted() {
        let units = vec![unit("a", "A", &[])];
        let mut snap = snapshot(vec![built(&units[0], &[]), built(&unit("b", "B", &[]), &[])]);
        snap.corrupt.push(UnitId::from("c"));
        let graph = DependencyGraph::from_units(&units);

        let changes = detect_changes(&units, &graph, &snap, false);
        assert_eq!(
            changes.deleted,
            BTreeSet::from([UnitId::from("b"), UnitId::from("c")])
        );
        assert!(changes.unchanged.contains(&UnitId::from("a")));
    }

    #[test]
    fn force_marks_everything_dirty() {
        let units = vec![unit("a", "A", &[])];
        let snap = snapshot(vec![built(&units[0], &[])]);
        let graph = DependencyGraph::from_units(&units);
        let changes = detect_changes(&units, &graph, &snap, true);
        assert_eq!(reason(&changes, "a"), Some(DirtyReason::Forced));
    }
}
