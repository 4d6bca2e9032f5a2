//! Core domain types for DocVault builds.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DocVaultError, Result};

/// Current schema version for persisted fingerprint records.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// UnitId
// ---------------------------------------------------------------------------

/// Stable, path-derived identifier of a source unit (e.g. `pkg.sub.module`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Hex-encoded SHA-256 digest of some content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a single byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Fingerprint an ordered sequence of byte slices.
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// SourceUnit
// ---------------------------------------------------------------------------

/// One analyzable code artifact, produced fresh by every source scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Path-derived identifier.
    pub id: UnitId,
    /// Location of the source on disk.
    pub path: PathBuf,
    /// Content fingerprint of the source bytes.
    pub fingerprint: Fingerprint,
    /// Declared dependency identifiers (may include ids outside the project).
    pub dependencies: Vec<UnitId>,
    /// Source size, used for memory admission.
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Classification of a unit-level build failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or unparseable source.
    Analysis,
    /// External documentation generation failed (including timeouts).
    Render,
    /// The unit's memory estimate exceeds the whole configured budget.
    ResourceExhaustion,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Analysis => "analysis",
            Self::Render => "render",
            Self::ResourceExhaustion => "resource-exhaustion",
        })
    }
}

/// A classified unit failure, as stored in records and build reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UnitFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error raised by a render collaborator for a single unit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnitError {
    #[error("analysis error: {0}")]
    Analysis(String),
    #[error("render error: {0}")]
    Render(String),
}

impl From<UnitError> for UnitFailure {
    fn from(err: UnitError) -> Self {
        match err {
            UnitError::Analysis(msg) => Self::new(FailureKind::Analysis, msg),
            UnitError::Render(msg) => Self::new(FailureKind::Render, msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// One rendered output file, relative to the owning unit's vault directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub relative_path: PathBuf,
    pub contents: Vec<u8>,
}

// ---------------------------------------------------------------------------
// FingerprintRecord
// ---------------------------------------------------------------------------

/// Outcome of the last build attempt for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
}

/// Persisted build state for one source unit.
///
/// `output_fingerprint` may be reused only while `input_fingerprint` matches
/// the current source and every entry of `dependency_snapshot` still names an
/// existing unit whose output fingerprint is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub schema_version: u32,
    pub unit_id: UnitId,
    pub input_fingerprint: Fingerprint,
    /// Cleared when the last build failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_fingerprint: Option<Fingerprint>,
    pub last_build_status: BuildStatus,
    /// Dependency id -> that dependency's output fingerprint when this record was written.
    #[serde(default)]
    pub dependency_snapshot: BTreeMap<UnitId, Option<Fingerprint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<UnitFailure>,
    #[serde(default)]
    pub artifact_count: usize,
    pub built_at: DateTime<Utc>,
}

impl FingerprintRecord {
    /// SHA-256 over the record's canonical JSON, stored alongside it to detect damage.
    pub fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| DocVaultError::validation(format!("record serialization: {e}")))?;
        Ok(Fingerprint::of_bytes(&bytes).0)
    }

    pub fn is_failure(&self) -> bool {
        self.last_build_status == BuildStatus::Failure
    }
}

/// Everything the store knows, read once at the start of a build.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub records: BTreeMap<UnitId, FingerprintRecord>,
    /// Entries that failed their checksum or could not be decoded.
    pub corrupt: Vec<UnitId>,
    /// Set when the whole store was unreadable and the build starts from scratch.
    pub reset: bool,
}

impl StoreSnapshot {
    /// Output fingerprint currently recorded for `id`, if any.
    pub fn output_of(&self, id: &UnitId) -> Option<&Fingerprint> {
        self.records
            .get(id)
            .and_then(|r| r.output_fingerprint.as_ref())
    }
}
