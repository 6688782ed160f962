//! Error taxonomy shared by the core and daemon crates.
//!
//! Mirrors the kinds laid out for validation/storage/config failures: each
//! variant is a stable, user-facing error code plus a human message so
//! callers across the control plane never have to pattern-match on string
//! text.

use std::path::PathBuf;
use thiserror::Error;

/// Validation outcome codes surfaced to control-plane callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValidationCode {
    NotExists,
    NotDirectory,
    Duplicate,
    Subfolder,
    Ancestor,
}

impl ValidationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotExists => "NOT_EXISTS",
            Self::NotDirectory => "NOT_DIRECTORY",
            Self::Duplicate => "DUPLICATE",
            Self::Subfolder => "SUBFOLDER",
            Self::Ancestor => "ANCESTOR",
        }
    }
}

/// A single validation error or warning, carrying the affected path(s).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
    #[serde(default)]
    pub affected: Vec<PathBuf>,
}

impl ValidationIssue {
    pub fn not_exists(path: &std::path::Path) -> Self {
        Self {
            code: ValidationCode::NotExists,
            message: format!("path does not exist: {}", path.display()),
            affected: vec![],
        }
    }

    pub fn not_directory(path: &std::path::Path) -> Self {
        Self {
            code: ValidationCode::NotDirectory,
            message: format!("path exists but is not a directory: {}", path.display()),
            affected: vec![],
        }
    }

    pub fn duplicate(path: &std::path::Path) -> Self {
        Self {
            code: ValidationCode::Duplicate,
            message: format!("folder already managed: {}", path.display()),
            affected: vec![path.to_path_buf()],
        }
    }

    pub fn subfolder(path: &std::path::Path, parent: &std::path::Path) -> Self {
        Self {
            code: ValidationCode::Subfolder,
            message: format!(
                "{} is a strict descendant of managed folder {}",
                path.display(),
                parent.display()
            ),
            affected: vec![parent.to_path_buf()],
        }
    }

    pub fn ancestor(path: &std::path::Path, affected: Vec<PathBuf>) -> Self {
        Self {
            code: ValidationCode::Ancestor,
            message: format!(
                "{} strictly contains {} already-managed folder(s)",
                path.display(),
                affected.len()
            ),
            affected,
        }
    }
}

/// Result of `ValidateFolder`/`AddFolder` style checks.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

/// Storage-engine failure kinds (§7 TransientIOError / CorruptionError).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("storage at {path} is corrupted: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Configuration failure kinds (§7 ConfigurationError).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("{key} out of range: {message}")]
    OutOfRange { key: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read configuration file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Path/fingerprint service failures.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("io error normalizing {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("document id for {0:?} collapsed to empty string")]
    EmptyDocumentId(String),
}
