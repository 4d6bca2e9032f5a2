//! Shared types, error model, and configuration for DocVault.
//!
//! This crate is the foundation depended on by all other DocVault crates.
//! It provides:
//! - [`DocVaultError`]: the unified error type
//! - Domain types ([`SourceUnit`], [`FingerprintRecord`], [`UnitId`], [`Fingerprint`])
//! - The [`FingerprintStore`] contract
//! - Configuration ([`AppConfig`], [`BuildConfig`], config loading)

pub mod config;
pub mod error;
pub mod store;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuildConfig, BuildSettings, CONFIG_FILE_NAME, ProjectConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{DocVaultError, Result};
pub use store::{FingerprintStore, RunSummary, StoreStats};
pub use types::{
    Artifact, BuildStatus, FailureKind, Fingerprint, FingerprintRecord, RECORD_SCHEMA_VERSION,
    SourceUnit, StoreSnapshot, UnitError, UnitFailure, UnitId,
};
