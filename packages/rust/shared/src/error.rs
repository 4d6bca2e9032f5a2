//! Error types for DocVault.
//!
//! Library crates use [`DocVaultError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only store-level and configuration-level problems surface as
//! [`DocVaultError`]. A single unit failing to analyze or render is recorded
//! as data ([`crate::UnitFailure`]) and never aborts a build.

use std::path::PathBuf;

use crate::types::UnitId;

/// Top-level error type for all DocVault operations.
#[derive(Debug, thiserror::Error)]
pub enum DocVaultError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Fingerprint store read/write error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted build state could not be read back.
    #[error("store corruption: {message}")]
    StoreCorruption { message: String },

    /// The dependency graph contains cycles.
    #[error("cyclic dependency: {}", format_cycles(.cycles))]
    CyclicDependency { cycles: Vec<Vec<UnitId>> },

    /// A build target names no known source unit.
    #[error("unknown build target: {0}")]
    UnknownTarget(UnitId),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (duplicate unit ids, invalid artifact path, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocVaultError>;

impl DocVaultError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a store corruption error from any displayable message.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::StoreCorruption {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn format_cycles(cycles: &[Vec<UnitId>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut parts: Vec<&str> = cycle.iter().map(UnitId::as_str).collect();
            if let Some(first) = cycle.first() {
                parts.push(first.as_str());
            }
            parts.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}
