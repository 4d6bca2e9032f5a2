//! Dependency graph over source units.
//!
//! An edge `A -> B` means A's documentation depends on B's output. The graph
//! is rebuilt from the scan on every run and never persisted. All maps are
//! ordered so traversal, cycle reports and topological orders are stable.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use docvault_shared::{DocVaultError, Result, SourceUnit, UnitId};
use tracing::debug;

static EMPTY: BTreeSet<UnitId> = BTreeSet::new();

/// Directed dependency graph keyed by unit id.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// `unit -> units it depends on`
    deps: BTreeMap<UnitId, BTreeSet<UnitId>>,
    /// `unit -> units that depend on it`
    rdeps: BTreeMap<UnitId, BTreeSet<UnitId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for one scan. Dependencies on ids that are not
    /// current units are external and produce no edge.
    pub fn from_units(units: &[SourceUnit]) -> Self {
        let mut graph = Self::new();
        for unit in units {
            graph.add_node(unit.id.clone());
        }
        let mut external = 0usize;
        for unit in units {
            for dep in &unit.dependencies {
                if !graph.add_edge(&unit.id, dep) {
                    external += 1;
                }
            }
        }
        debug!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            external,
            "dependency graph built"
        );
        graph
    }

    pub fn add_node(&mut self, id: UnitId) {
        self.rdeps.entry(id.clone()).or_default();
        self.deps.entry(id).or_default();
    }

    /// Add `from -> to`. Returns `false` (and adds nothing) if either end is unknown.
    pub fn add_edge(&mut self, from: &UnitId, to: &UnitId) -> bool {
        if !self.contains(from) || !self.contains(to) {
            return false;
        }
        if let Some(deps) = self.deps.get_mut(from) {
            deps.insert(to.clone());
        }
        if let Some(rdeps) = self.rdeps.get_mut(to) {
            rdeps.insert(from.clone());
        }
        true
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.deps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.deps.values().map(BTreeSet::len).sum()
    }

    /// All node ids in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = &UnitId> {
        self.deps.keys()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &UnitId) -> &BTreeSet<UnitId> {
        self.deps.get(id).unwrap_or(&EMPTY)
    }

    /// Units that depend on `id` directly.
    pub fn direct_dependents_of(&self, id: &UnitId) -> &BTreeSet<UnitId> {
        self.rdeps.get(id).unwrap_or(&EMPTY)
    }

    /// Every unit that transitively depends on `id`. Contains `id` itself
    /// only when `id` sits on a cycle.
    pub fn dependents_of(&self, id: &UnitId) -> BTreeSet<UnitId> {
        reach(self.direct_dependents_of(id).iter(), |n| {
            self.direct_dependents_of(n)
        })
    }

    /// `set` plus every unit that transitively depends on a member of it.
    pub fn dependents_closure(&self, set: &BTreeSet<UnitId>) -> BTreeSet<UnitId> {
        reach(set.iter().filter(|id| self.contains(id)), |n| {
            self.direct_dependents_of(n)
        })
    }

    /// `set` plus everything its members transitively depend on.
    pub fn dependency_closure(&self, set: &BTreeSet<UnitId>) -> BTreeSet<UnitId> {
        reach(set.iter().filter(|id| self.contains(id)), |n| {
            self.dependencies_of(n)
        })
    }

    /// Find cycles with an iterative depth-first search.
    ///
    /// Each back edge yields one cycle, rotated to start at its smallest id.
    /// A self-dependency is a cycle of length one. This is not every
    /// elementary cycle: a cycle that closes through a node the search has
    /// already finished shares its back edge with one already reported and
    /// is not listed again. Every unit on any cycle still lands in a
    /// reported cycle's strongly connected group (see
    /// [`DependencyGraph::cyclic_groups`]).
    pub fn detect_cycles(&self) -> Vec<Vec<UnitId>> {
        let mut color: BTreeMap<&UnitId, Color> =
            self.deps.keys().map(|id| (id, Color::White)).collect();
        let mut cycles: BTreeSet<Vec<UnitId>> = BTreeSet::new();

        for start in self.deps.keys() {
            if color.get(start) != Some(&Color::White) {
                continue;
            }
            color.insert(start, Color::Gray);
            let mut path: Vec<&UnitId> = vec![start];
            let mut stack = vec![self.dependencies_of(start).iter()];

            while let Some(edges) = stack.last_mut() {
                match edges.next() {
                    Some(next) => match color.get(next).copied().unwrap_or(Color::Black) {
                        Color::White => {
                            color.insert(next, Color::Gray);
                            path.push(next);
                            stack.push(self.dependencies_of(next).iter());
                        }
                        Color::Gray => {
                            if let Some(pos) = path.iter().rposition(|n| *n == next) {
                                cycles.insert(canonical_cycle(&path[pos..]));
                            }
                        }
                        Color::Black => {}
                    },
                    None => {
                        if let Some(done) = path.pop() {
                            color.insert(done, Color::Black);
                        }
                        stack.pop();
                    }
                }
            }
        }

        cycles.into_iter().collect()
    }

    /// The strongly connected group around each detected cycle.
    ///
    /// A group is every unit both reachable from and reaching a cycle member.
    /// Groups are disjoint and returned in order of their smallest id.
    pub fn cyclic_groups(&self, cycles: &[Vec<UnitId>]) -> Vec<BTreeSet<UnitId>> {
        let mut grouped: BTreeSet<UnitId> = BTreeSet::new();
        let mut groups: Vec<BTreeSet<UnitId>> = Vec::new();

        for member in cycles.iter().flatten() {
            if grouped.contains(member) || !self.contains(member) {
                continue;
            }
            let seed = BTreeSet::from([member.clone()]);
            let forward = self.dependency_closure(&seed);
            let backward = self.dependents_closure(&seed);
            let group: BTreeSet<UnitId> = forward.intersection(&backward).cloned().collect();
            grouped.extend(group.iter().cloned());
            groups.push(group);
        }

        groups.sort_by(|a, b| a.first().cmp(&b.first()));
        groups
    }

    /// Order `subset` plus its dependency closure so dependencies come first.
    ///
    /// Among units whose dependencies are all placed, the smallest id goes
    /// next. Fails with [`DocVaultError::CyclicDependency`] if the closure
    /// contains a cycle.
    pub fn topological_order(&self, subset: &BTreeSet<UnitId>) -> Result<Vec<UnitId>> {
        let scope = self.dependency_closure(subset);

        let mut remaining: BTreeMap<&UnitId, usize> = scope
            .iter()
            .map(|id| (id, self.dependencies_of(id).len()))
            .collect();
        let mut ready: BTreeSet<&UnitId> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(scope.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for dependent in self.direct_dependents_of(id) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < scope.len() {
            let placed: BTreeSet<&UnitId> = order.iter().collect();
            let cycles: Vec<Vec<UnitId>> = self
                .detect_cycles()
                .into_iter()
                .filter(|cycle| {
                    cycle
                        .iter()
                        .all(|id| scope.contains(id) && !placed.contains(id))
                })
                .collect();
            return Err(DocVaultError::CyclicDependency { cycles });
        }

        Ok(order)
    }
}

/// Breadth-first reachability from `seeds` (included) along `next`.
fn reach<'a, I, F>(seeds: I, next: F) -> BTreeSet<UnitId>
where
    I: Iterator<Item = &'a UnitId>,
    F: Fn(&UnitId) -> &'a BTreeSet<UnitId>,
{
    let mut seen: BTreeSet<UnitId> = BTreeSet::new();
    let mut queue: VecDeque<&UnitId> = seeds.collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        queue.extend(next(id).iter().filter(|n| !seen.contains(*n)));
    }
    seen
}

fn canonical_cycle(path: &[&UnitId]) -> Vec<UnitId> {
    let start = path
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    path[start..]
        .iter()
        .chain(path[..start].iter())
        .map(|id| (*id).clone())
        .collect()
}
