//! Filesystem vault: one directory per unit under the vault root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use docvault_core::ArtifactVault;
use docvault_shared::{Artifact, DocVaultError, ProjectConfig, Result, UnitId};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

#[derive(Debug, Clone)]
pub struct FsVault {
    root: PathBuf,
}

impl FsVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Vault for the `[project]` section of a config, relative to `project_root`.
    pub fn from_config(project_root: &Path, config: &ProjectConfig) -> Self {
        Self::new(project_root.join(&config.vault_dir))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything rendered for `unit_id`.
    pub fn unit_dir(&self, unit_id: &UnitId) -> Result<PathBuf> {
        let id = unit_id.as_str();
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\'])
            || id.chars().any(char::is_control)
        {
            return Err(DocVaultError::validation(format!(
                "unit id {id:?} cannot name a vault directory"
            )));
        }
        Ok(self.root.join(id))
    }

    /// Remove staging and trash directories left by an interrupted write.
    pub fn sweep(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(DocVaultError::io(&self.root, e)),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| DocVaultError::io(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                let path = entry.path();
                fs::remove_dir_all(&path).map_err(|e| DocVaultError::io(&path, e))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept interrupted vault writes");
        }
        Ok(removed)
    }

    fn scratch_dir(&self, prefix: &str, unit_id: &UnitId) -> PathBuf {
        self.root.join(format!("{prefix}{unit_id}-{}", Uuid::now_v7()))
    }

    fn swap(&self, unit_id: &UnitId, staging: &Path, target: &Path) -> Result<()> {
        if !target.exists() {
            return fs::rename(staging, target).map_err(|e| DocVaultError::io(target, e));
        }

        let trash = self.scratch_dir(TRASH_PREFIX, unit_id);
        fs::rename(target, &trash).map_err(|e| DocVaultError::io(target, e))?;
        if let Err(e) = fs::rename(staging, target) {
            // Put the previous notes back so the unit is never left empty.
            let _ = fs::rename(&trash, target);
            return Err(DocVaultError::io(target, e));
        }
        if let Err(e) = fs::remove_dir_all(&trash) {
            warn!(path = %trash.display(), error = %e, "could not remove replaced notes");
        }
        Ok(())
    }
}

impl ArtifactVault for FsVault {
    /// Write into a fresh staging directory, then swap it in with renames.
    /// Readers see the old directory or the new one, never a partial write.
    #[instrument(skip_all, fields(unit = %unit_id, artifacts = artifacts.len()))]
    fn write_artifacts(&self, unit_id: &UnitId, artifacts: &[Artifact]) -> Result<()> {
        let target = self.unit_dir(unit_id)?;
        fs::create_dir_all(&self.root).map_err(|e| DocVaultError::io(&self.root, e))?;

        let staging = self.scratch_dir(STAGING_PREFIX, unit_id);
        let result = write_tree(&staging, artifacts)
            .and_then(|()| self.swap(unit_id, &staging, &target));
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    fn delete_artifacts(&self, unit_id: &UnitId) -> Result<()> {
        let target = self.unit_dir(unit_id)?;
        match fs::remove_dir_all(&target) {
            Ok(()) => {
                debug!(unit = %unit_id, "unit directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DocVaultError::io(&target, e)),
        }
    }
}

fn write_tree(dir: &Path, artifacts: &[Artifact]) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| DocVaultError::io(dir, e))?;
    for artifact in artifacts {
        let path = dir.join(&artifact.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DocVaultError::io(parent, e))?;
        }
        fs::write(&path, &artifact.contents).map_err(|e| DocVaultError::io(&path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault() -> FsVault {
        FsVault::new(std::env::temp_dir().join(format!("dv-vault-test-{}", Uuid::now_v7())))
    }

    fn artifact(path: &str, contents: &str) -> Artifact {
        Artifact {
            relative_path: path.into(),
            contents: contents.as_bytes().to_vec(),
        }
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn writes_into_unit_directory() {
        let vault = temp_vault();
        let id = UnitId::from("pkg.mod");
        vault
            .write_artifacts(
                &id,
                &[artifact("index.md", "# pkg.mod"), artifact("api/f.md", "f")],
            )
            .unwrap();

        let dir = vault.unit_dir(&id).unwrap();
        assert_eq!(fs::read_to_string(dir.join("index.md")).unwrap(), "# pkg.mod");
        assert_eq!(fs::read_to_string(dir.join("api/f.md")).unwrap(), "f");
        assert_eq!(listing(vault.root()), vec!["pkg.mod"]);
        let _ = fs::remove_dir_all(vault.root());
    }

    #[test]
    fn rewrite_replaces_previous_notes() {
        let vault = temp_vault();
        let id = UnitId::from("pkg.mod");
        vault
            .write_artifacts(&id, &[artifact("index.md", "v1"), artifact("old.md", "x")])
            .unwrap();
        vault.write_artifacts(&id, &[artifact("index.md", "v2")]).unwrap();

        let dir = vault.unit_dir(&id).unwrap();
        assert_eq!(listing(&dir), vec!["index.md"]);
        assert_eq!(fs::read_to_string(dir.join("index.md")).unwrap(), "v2");
        // No staging or trash directories remain.
        assert_eq!(listing(vault.root()), vec!["pkg.mod"]);
        let _ = fs::remove_dir_all(vault.root());
    }

    #[test]
    fn delete_removes_only_that_unit() {
        let vault = temp_vault();
        let a = UnitId::from("a");
        let b = UnitId::from("b");
        vault.write_artifacts(&a, &[artifact("index.md", "a")]).unwrap();
        vault.write_artifacts(&b, &[artifact("index.md", "b")]).unwrap();

        vault.delete_artifacts(&a).unwrap();
        assert_eq!(listing(vault.root()), vec!["b"]);
        // Deleting again, or deleting something never written, is fine.
        vault.delete_artifacts(&a).unwrap();
        vault.delete_artifacts(&UnitId::from("never")).unwrap();
        let _ = fs::remove_dir_all(vault.root());
    }

    #[test]
    fn rejects_ids_that_escape_the_root() {
        let vault = temp_vault();
        for bad in ["", "../up", "a/b", ".hidden"] {
            assert!(vault.unit_dir(&UnitId::from(bad)).is_err(), "{bad:?}");
        }
        assert!(vault.unit_dir(&UnitId::from("pkg.__init__")).is_ok());
    }

    #[test]
    fn sweep_clears_interrupted_writes() {
        let vault = temp_vault();
        assert_eq!(vault.sweep().unwrap(), 0);

        fs::create_dir_all(vault.root().join(".staging-a-1")).unwrap();
        fs::create_dir_all(vault.root().join(".trash-a-2")).unwrap();
        vault
            .write_artifacts(&UnitId::from("a"), &[artifact("index.md", "a")])
            .unwrap();
        assert_eq!(vault.sweep().unwrap(), 2);
        assert_eq!(listing(vault.root()), vec!["a"]);
        let _ = fs::remove_dir_all(vault.root());
    }
}
