//! Application configuration for DocVault.
//!
//! Project config lives at `<project>/docvault.toml`; a user-level fallback
//! lives at `~/.docvault/docvault.toml`. CLI flags override config file
//! values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DocVaultError, Result};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "docvault.toml";

/// Default user config directory name under the home directory.
const CONFIG_DIR_NAME: &str = ".docvault";

// ---------------------------------------------------------------------------
// Config structs (matching docvault.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Project layout.
    #[serde(default)]
    pub project: ProjectConfig,

    /// Scheduling and cache settings.
    #[serde(default)]
    pub build: BuildSettings,
}

/// `[project]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Root of the source tree to document.
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    /// Output vault directory.
    #[serde(default = "default_vault_dir")]
    pub vault_dir: String,

    /// Fingerprint store database file.
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Source path glob patterns to ignore.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            vault_dir: default_vault_dir(),
            state_file: default_state_file(),
            exclude_patterns: Vec::new(),
        }
    }
}

fn default_source_dir() -> String {
    ".".into()
}
fn default_vault_dir() -> String {
    "vault".into()
}
fn default_state_file() -> String {
    ".docvault/state.db".into()
}

/// `[build]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Parallel workers; defaults to the number of CPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Memory budget for in-flight units, in MiB.
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,

    /// Estimated working memory per byte of source.
    #[serde(default = "default_memory_per_source_byte")]
    pub memory_per_source_byte: u64,

    /// Per-unit render timeout in seconds.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Force a full rebuild when the last one is older than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_full_after_hours: Option<f64>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            workers: None,
            memory_budget_mb: default_memory_budget_mb(),
            memory_per_source_byte: default_memory_per_source_byte(),
            task_timeout_secs: default_task_timeout_secs(),
            force_full_after_hours: None,
        }
    }
}

fn default_memory_budget_mb() -> u64 {
    1024
}
fn default_memory_per_source_byte() -> u64 {
    64
}
fn default_task_timeout_secs() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Build config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime build configuration, merged from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Maximum units built concurrently.
    pub workers: usize,
    /// Ceiling on the summed memory estimate of in-flight units, in bytes.
    pub memory_budget: u64,
    /// Memory estimate multiplier applied to `SourceUnit::size_bytes`.
    pub memory_per_source_byte: u64,
    /// Per-unit render timeout.
    pub task_timeout: Duration,
    /// Force a full rebuild after this long without one.
    pub force_full_after: Option<Duration>,
}

impl BuildConfig {
    fn with_settings(build: &BuildSettings) -> Self {
        Self {
            workers: build.workers.unwrap_or_else(num_cpus::get).max(1),
            memory_budget: build.memory_budget_mb.saturating_mul(1024 * 1024),
            memory_per_source_byte: build.memory_per_source_byte,
            task_timeout: Duration::from_secs(build.task_timeout_secs),
            force_full_after: None,
        }
    }

    /// Reject settings the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DocVaultError::config("workers must be at least 1"));
        }
        if self.memory_budget == 0 {
            return Err(DocVaultError::config("memory budget must be non-zero"));
        }
        if self.task_timeout.is_zero() {
            return Err(DocVaultError::config("task timeout must be non-zero"));
        }
        Ok(())
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::with_settings(&BuildSettings::default())
    }
}

impl TryFrom<&AppConfig> for BuildConfig {
    type Error = DocVaultError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let build = &config.build;
        // Zero turns the forced full rebuild off.
        let force_full_after = match build.force_full_after_hours {
            None => None,
            Some(hours) if hours == 0.0 => None,
            Some(hours) => Some(Duration::try_from_secs_f64(hours * 3600.0).map_err(|e| {
                DocVaultError::config(format!("force_full_after_hours = {hours}: {e}"))
            })?),
        };
        Ok(Self {
            force_full_after,
            ..Self::with_settings(build)
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the user config directory (`~/.docvault/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocVaultError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Locate the config for `project_root`: the project file first, then the user file.
pub fn config_file_path(project_root: &Path) -> Result<PathBuf> {
    let local = project_root.join(CONFIG_FILE_NAME);
    if local.exists() {
        return Ok(local);
    }
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the config for a project. Returns defaults if no file exists.
pub fn load_config(project_root: &Path) -> Result<AppConfig> {
    let path = config_file_path(project_root)?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocVaultError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        DocVaultError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Write a default `docvault.toml` into `project_root`.
/// Returns the path to the created file.
pub fn init_config(project_root: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(project_root).map_err(|e| DocVaultError::io(project_root, e))?;

    let path = project_root.join(CONFIG_FILE_NAME);
    if path.exists() {
        return Err(DocVaultError::config(format!(
            "{} already exists",
            path.display()
        )));
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocVaultError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocVaultError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("vault_dir"));
        assert!(toml_str.contains("memory_budget_mb"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.build.memory_budget_mb, 1024);
        assert_eq!(parsed.project.state_file, ".docvault/state.db");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[project]
source_dir = "src"
exclude_patterns = ["tests/**"]

[build]
workers = 3
force_full_after_hours = 24.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.project.source_dir, "src");
        assert_eq!(config.project.vault_dir, "vault");
        assert_eq!(config.project.exclude_patterns, vec!["tests/**"]);
        assert_eq!(config.build.workers, Some(3));
        assert_eq!(config.build.task_timeout_secs, 120);
    }

    #[test]
    fn build_config_from_app_config() {
        let mut app = AppConfig::default();
        app.build.workers = Some(3);
        app.build.memory_budget_mb = 2;
        app.build.force_full_after_hours = Some(1.5);
        let build = BuildConfig::try_from(&app).expect("valid settings");
        assert_eq!(build.workers, 3);
        assert_eq!(build.memory_budget, 2 * 1024 * 1024);
        assert_eq!(build.task_timeout, Duration::from_secs(120));
        assert_eq!(build.force_full_after, Some(Duration::from_secs(5400)));
        assert!(build.validate().is_ok());
    }

    #[test]
    fn full_rebuild_interval_must_be_a_representable_duration() {
        let mut app = AppConfig::default();
        for bad in [1e300, -2.0, f64::NAN, f64::INFINITY] {
            app.build.force_full_after_hours = Some(bad);
            let err = BuildConfig::try_from(&app).unwrap_err();
            assert!(matches!(err, DocVaultError::Config { .. }), "{bad}");
            assert!(err.to_string().contains("force_full_after_hours"), "{bad}");
        }

        app.build.force_full_after_hours = Some(0.0);
        let build = BuildConfig::try_from(&app).expect("zero disables");
        assert_eq!(build.force_full_after, None);
    }

    #[test]
    fn build_config_rejects_zero_budget() {
        let mut build = BuildConfig::default();
        build.memory_budget = 0;
        let err = build.validate().unwrap_err();
        assert!(err.to_string().contains("memory budget"));
    }

    #[test]
    fn init_config_writes_project_file() {
        let dir = std::env::temp_dir().join(format!(
            "docvault-config-test-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let path = init_config(&dir).expect("init");
        assert!(path.ends_with(CONFIG_FILE_NAME));

        let loaded = load_config(&dir).expect("load");
        assert_eq!(loaded.project.vault_dir, "vault");

        // A second init refuses to overwrite.
        assert!(init_config(&dir).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
