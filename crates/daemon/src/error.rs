//! Daemon-level error taxonomy (spec §7), layered on top of
//! [`folderd_core::error`]. Component errors are typed; `main.rs` collapses
//! everything into `anyhow` at the binary edge, mirroring how `codescope`
//! threads `Result<_, String>` internally but gives its lifecycle-adjacent
//! code (the otters reference) a proper `thiserror` enum at the boundary.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model '{0}' is not in the curated registry")]
    UnknownModel(String),

    #[error("failed to load model '{model_id}': {message}")]
    LoadFailed { model_id: String, message: String },

    #[error("inference failed for model '{model_id}': {message}")]
    InferenceFailed { model_id: String, message: String },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("child process failed to start: {0}")]
    StartFailed(String),

    #[error("child process exceeded restart budget ({attempts} attempts)")]
    RestartBudgetExceeded { attempts: u32 },

    #[error("child process did not exit within {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum SingletonError {
    #[error("another folderd daemon is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("could not determine a state directory for the registry file")]
    NoStateDir,

    #[error("registry io error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("registry file at {path} is malformed: {source}")]
    Malformed { path: PathBuf, #[source] source: serde_json::Error },
}

/// §7 "invariant broken" category: a bug in this codebase's own state
/// management, not a recoverable external failure. Callers that detect one
/// are expected to `panic!` with it rather than propagate a `Result`
/// (see `orchestrator::transition_or_panic`).
#[derive(Debug, Error)]
pub enum FatalInternalError {
    #[error("illegal state transition attempted: {0}")]
    IllegalTransition(String),
}

/// Errors the control-plane facade itself can return, layered on top of
/// whatever the underlying component failed with (§4.K step 1: "reject
/// further control-plane requests with a service-unavailable response").
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("daemon is shutting down, service unavailable")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] folderd_core::error::StorageError),
}
