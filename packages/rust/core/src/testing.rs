//! In-memory collaborators for engine tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use docvault_shared::{Artifact, Fingerprint, Result, SourceUnit, UnitError, UnitId};

use crate::collab::{ArtifactVault, DocRenderer, SourceScanner};

pub(crate) fn unit(id: &str, content: &str, deps: &[&str]) -> SourceUnit {
    SourceUnit {
        id: UnitId::from(id),
        path: format!("{}.py", id.replace('.', "/")).into(),
        fingerprint: Fingerprint::of_bytes(content.as_bytes()),
        dependencies: deps.iter().map(|d| UnitId::from(*d)).collect(),
        size_bytes: content.len() as u64,
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeScanner {
    units: Mutex<Vec<SourceUnit>>,
}

impl FakeScanner {
    pub fn new(units: Vec<SourceUnit>) -> Self {
        Self {
            units: Mutex::new(units),
        }
    }

    pub fn set(&self, units: Vec<SourceUnit>) {
        *self.units.lock().unwrap() = units;
    }

    /// Replace one unit's content, keeping its dependencies.
    pub fn edit(&self, id: &str, content: &str) {
        let mut units = self.units.lock().unwrap();
        if let Some(u) = units.iter_mut().find(|u| u.id.as_str() == id) {
            u.fingerprint = Fingerprint::of_bytes(content.as_bytes());
            u.size_bytes = content.len() as u64;
        }
    }

    pub fn remove(&self, id: &str) {
        self.units.lock().unwrap().retain(|u| u.id.as_str() != id);
    }
}

impl SourceScanner for FakeScanner {
    fn scan_sources(&self) -> Result<Vec<SourceUnit>> {
        Ok(self.units.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RendererState {
    calls: Vec<UnitId>,
    active: BTreeSet<UnitId>,
    max_active: usize,
    overlapping: Vec<UnitId>,
    analysis_failures: BTreeSet<UnitId>,
    panics: BTreeSet<UnitId>,
    delays: BTreeMap<UnitId, Duration>,
}

/// Renders `index.md` containing the unit id and fingerprint. Records every
/// call and flags a unit rendered twice at the same time.
#[derive(Default)]
pub(crate) struct FakeRenderer {
    state: Mutex<RendererState>,
}

impl FakeRenderer {
    pub fn fail_analysis(&self, id: &str) {
        self.state.lock().unwrap().analysis_failures.insert(UnitId::from(id));
    }

    pub fn heal(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.analysis_failures.remove(&UnitId::from(id));
        state.panics.remove(&UnitId::from(id));
    }

    pub fn panic_on(&self, id: &str) {
        self.state.lock().unwrap().panics.insert(UnitId::from(id));
    }

    pub fn delay(&self, id: &str, by: Duration) {
        self.state.lock().unwrap().delays.insert(UnitId::from(id), by);
    }

    pub fn calls(&self) -> Vec<UnitId> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn overlapping(&self) -> Vec<UnitId> {
        self.state.lock().unwrap().overlapping.clone()
    }
}

impl DocRenderer for FakeRenderer {
    fn analyze_and_render(
        &self,
        unit: &SourceUnit,
    ) -> std::result::Result<Vec<Artifact>, UnitError> {
        let (delay, fail, panic) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(unit.id.clone());
            if !state.active.insert(unit.id.clone()) {
                state.overlapping.push(unit.id.clone());
            }
            state.max_active = state.max_active.max(state.active.len());
            (
                state.delays.get(&unit.id).copied(),
                state.analysis_failures.contains(&unit.id),
                state.panics.contains(&unit.id),
            )
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        } else {
            std::thread::sleep(Duration::from_millis(2));
        }
        self.state.lock().unwrap().active.remove(&unit.id);

        if panic {
            panic!("renderer exploded on {}", unit.id);
        }
        if fail {
            return Err(UnitError::Analysis(format!("cannot parse {}", unit.id)));
        }
        Ok(vec![Artifact {
            relative_path: "index.md".into(),
            contents: format!("# {}\n{}\n", unit.id, unit.fingerprint).into_bytes(),
        }])
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeVault {
    files: Mutex<BTreeMap<UnitId, Vec<Artifact>>>,
}

impl FakeVault {
    pub fn contains(&self, id: &UnitId) -> bool {
        self.files.lock().unwrap().contains_key(id)
    }

    pub fn contents(&self) -> BTreeMap<UnitId, Vec<Artifact>> {
        self.files.lock().unwrap().clone()
    }
}

impl ArtifactVault for FakeVault {
    fn write_artifacts(&self, unit_id: &UnitId, artifacts: &[Artifact]) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(unit_id.clone(), artifacts.to_vec());
        Ok(())
    }

    fn delete_artifacts(&self, unit_id: &UnitId) -> Result<()> {
        self.files.lock().unwrap().remove(unit_id);
        Ok(())
    }
}
