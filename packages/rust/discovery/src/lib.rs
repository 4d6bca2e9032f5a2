//! Source discovery for Python package trees.
//!
//! [`FsScanner`] walks a source root, maps every `.py` file to a dotted unit
//! id, fingerprints its bytes and resolves its imports against the other
//! units found in the same scan. Results are sorted by unit id so repeated
//! scans of an unchanged tree are identical.

mod imports;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use docvault_core::SourceScanner;
use docvault_shared::{DocVaultError, Fingerprint, ProjectConfig, Result, SourceUnit, UnitId};
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &["__pycache__", "node_modules", "venv", "site-packages"];

// ---------------------------------------------------------------------------
// FsScanner
// ---------------------------------------------------------------------------

/// Filesystem-backed [`SourceScanner`] for Python sources.
#[derive(Debug, Clone)]
pub struct FsScanner {
    root: PathBuf,
    exclude_patterns: Vec<Regex>,
}

/// A discovered file before import resolution.
struct Discovered {
    id: UnitId,
    path: PathBuf,
    is_package: bool,
    content: Option<Vec<u8>>,
    read_error: Option<String>,
}

impl FsScanner {
    /// Create a scanner rooted at `root`. Invalid glob patterns are ignored.
    pub fn new(root: impl Into<PathBuf>, exclude_patterns: &[String]) -> Self {
        Self {
            root: root.into(),
            exclude_patterns: exclude_patterns
                .iter()
                .filter_map(|p| glob_to_regex(p))
                .collect(),
        }
    }

    /// Scanner for the `[project]` section of a config, relative to `project_root`.
    pub fn from_config(project_root: &Path, config: &ProjectConfig) -> Self {
        Self::new(
            project_root.join(&config.source_dir),
            &config.exclude_patterns,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded(&self, relative: &str) -> bool {
        self.exclude_patterns.iter().any(|p| p.is_match(relative))
    }

    /// Walk the tree and collect every `.py` file keyed by unit id.
    fn discover(&self) -> Result<BTreeMap<UnitId, Discovered>> {
        if !self.root.is_dir() {
            return Err(DocVaultError::config(format!(
                "source directory {} does not exist",
                self.root.display()
            )));
        }

        let mut found: BTreeMap<UnitId, Discovered> = BTreeMap::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref())
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                DocVaultError::io(path, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let relative_str = relative.to_string_lossy().replace('\\', "/");
            if self.is_excluded(&relative_str) {
                debug!(path = %relative_str, "excluded by pattern");
                continue;
            }
            let Some((id, is_package)) = unit_id_for(relative) else {
                debug!(path = %relative_str, "no unit id for file, skipping");
                continue;
            };

            if let Some(existing) = found.get(&id) {
                // A package directory shadows a same-named module file.
                let kept = if existing.is_package { existing.path.as_path() } else { path };
                warn!(unit = %id, kept = %kept.display(), "two files map to the same unit id");
                if existing.is_package {
                    continue;
                }
            }

            let (content, read_error) = match std::fs::read(path) {
                Ok(bytes) => (Some(bytes), None),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable source file");
                    (None, Some(e.to_string()))
                }
            };
            found.insert(
                id.clone(),
                Discovered {
                    id,
                    path: path.to_path_buf(),
                    is_package,
                    content,
                    read_error,
                },
            );
        }
        Ok(found)
    }
}

impl SourceScanner for FsScanner {
    #[instrument(skip_all, fields(root = %self.root.display()))]
    fn scan_sources(&self) -> Result<Vec<SourceUnit>> {
        let discovered = self.discover()?;
        let known: BTreeSet<String> = discovered.keys().map(|id| id.to_string()).collect();

        let units: Vec<SourceUnit> = discovered
            .into_values()
            .map(|file| {
                let (fingerprint, dependencies, size_bytes) = match (&file.content, &file.read_error)
                {
                    (Some(bytes), _) => {
                        let text = String::from_utf8_lossy(bytes);
                        let stmts = imports::parse_imports(&text);
                        let deps = imports::resolve_imports(
                            &stmts,
                            file.id.as_str(),
                            file.is_package,
                            &known,
                        );
                        (
                            Fingerprint::of_bytes(bytes),
                            deps.into_iter().map(UnitId::from).collect(),
                            bytes.len() as u64,
                        )
                    }
                    // Fingerprinted by the error so the unit stays dirty until it is readable.
                    (None, error) => (
                        Fingerprint::of_parts([
                            b"unreadable".as_slice(),
                            error.as_deref().unwrap_or_default().as_bytes(),
                        ]),
                        Vec::new(),
                        0,
                    ),
                };
                SourceUnit {
                    id: file.id,
                    path: file.path,
                    fingerprint,
                    dependencies,
                    size_bytes,
                }
            })
            .collect();

        info!(units = units.len(), "source scan complete");
        Ok(units)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `pkg/mod.py` -> `pkg.mod`, `pkg/__init__.py` -> `pkg` (a package).
fn unit_id_for(relative: &Path) -> Option<(UnitId, bool)> {
    let mut parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let file = parts.pop()?;
    let stem = file.strip_suffix(".py")?;
    let is_package = stem == "__init__";
    if !is_package {
        parts.push(stem.to_string());
    }
    if parts.is_empty() {
        return None;
    }
    Some((UnitId::from(parts.join(".")), is_package))
}

/// Convert a simple glob pattern to a regex (supports `*`, `**`, and `?`).
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).ok()
}
