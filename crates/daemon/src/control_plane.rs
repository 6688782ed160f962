//! Control-Plane Facade (spec §4.M).
//!
//! Grounded on `codescope::api.rs`'s handler shape — one function per
//! operation, a typed request struct in, a typed response or a typed error
//! out — generalized by dropping the `axum`/HTTP transport entirely. This
//! struct is transport-agnostic on purpose: the binary wires it up to
//! whatever IPC surface §6 eventually names, but nothing here knows about
//! that wire format.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use folderd_core::config::FolderConfig;
use folderd_core::error::ValidationResult;
use folderd_core::types::{FolderState, SearchHit};
use serde::{Deserialize, Serialize};

use crate::error::ControlPlaneError;
use crate::manager::FolderManager;
use crate::model_registry::ModelRegistry;
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Clone, Deserialize)]
pub struct AddFolderRequest {
    pub path: PathBuf,
    pub model: String,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderSummary {
    pub path: PathBuf,
    pub state: FolderState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub folder: PathBuf,
    pub query_vector: Vec<f32>,
    #[serde(default = "default_search_k")]
    pub k: usize,
}

fn default_search_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub managed_folder_count: usize,
    pub loaded_models: Vec<String>,
}

/// Thin facade over [`FolderManager`] and [`ModelRegistry`] exposing exactly
/// the six operations named in §4.M. Every method returns data, never an
/// HTTP status — the binary's transport layer (whatever it ends up being)
/// is responsible for mapping [`ControlPlaneError`] onto wire-level
/// failures. `shutdown` is checked at the top of every method so that once
/// the daemon starts shutting down, no further request reaches the folder
/// manager or model registry (§4.K step 1).
pub struct ControlPlane {
    manager: Arc<FolderManager>,
    registry: Arc<ModelRegistry>,
    max_concurrent: usize,
    shutdown: ShutdownFlag,
}

impl ControlPlane {
    pub fn new(
        manager: Arc<FolderManager>,
        registry: Arc<ModelRegistry>,
        max_concurrent: usize,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self { manager, registry, max_concurrent, shutdown }
    }

    fn check_alive(&self) -> Result<(), ControlPlaneError> {
        if self.shutdown.is_shutting_down() {
            return Err(ControlPlaneError::ShuttingDown);
        }
        Ok(())
    }

    pub fn validate_folder(&self, path: &Path) -> Result<ValidationResult, ControlPlaneError> {
        self.check_alive()?;
        Ok(self.manager.validate(path))
    }

    pub fn add_folder(&self, req: AddFolderRequest) -> Result<ValidationResult, ControlPlaneError> {
        self.check_alive()?;
        let validation = self.manager.validate(&req.path);
        if !validation.valid {
            return Ok(validation);
        }
        let cfg = FolderConfig { path: req.path, model: req.model, ignore: req.ignore, extensions: req.extensions };
        self.manager.start_folder(&cfg, self.max_concurrent)?;
        Ok(validation)
    }

    pub async fn remove_folder(&self, path: &Path) -> Result<(), ControlPlaneError> {
        self.check_alive()?;
        self.manager.stop_folder(path).await;
        Ok(())
    }

    pub fn list_folders(&self) -> Result<Vec<FolderSummary>, ControlPlaneError> {
        self.check_alive()?;
        Ok(self
            .manager
            .list_paths()
            .into_iter()
            .filter_map(|path| {
                let orchestrator = self.manager.get(&path)?;
                let state = orchestrator.state_rx.borrow().clone();
                Some(FolderSummary { path, state })
            })
            .collect())
    }

    /// Re-enter `scanning` from `error` (§4.F "error -> scanning: explicit
    /// 'retry' from control plane"). Returns `false` if the folder isn't
    /// managed or wasn't in `error`.
    pub async fn retry_folder(&self, path: &Path) -> Result<bool, ControlPlaneError> {
        self.check_alive()?;
        let Some(orchestrator) = self.manager.get(path) else { return Ok(false) };
        Ok(orchestrator.retry())
    }

    pub async fn status(&self) -> Result<StatusResponse, ControlPlaneError> {
        self.check_alive()?;
        let stats = self.registry.stats().await;
        Ok(StatusResponse { managed_folder_count: self.manager.managed_count(), loaded_models: stats.loaded })
    }

    /// Search one managed folder's store and dress the raw hits up with the
    /// owning document path and a text preview (§6 "Search hits").
    pub async fn search(&self, req: SearchRequest) -> Result<Vec<SearchHit>, ControlPlaneError> {
        self.check_alive()?;
        let orchestrator = match self.manager.get(&req.folder) {
            Some(o) => o,
            None => return Ok(Vec::new()),
        };
        Ok(orchestrator.search(&req.query_vector, req.k).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_folder_then_list_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(FolderManager::new(Arc::new(ModelRegistry::new(2))));
        let registry = Arc::new(ModelRegistry::new(2));
        let plane = ControlPlane::new(Arc::clone(&manager), registry, 3, ShutdownFlag::new());

        let req = AddFolderRequest { path: dir.path().to_path_buf(), model: "minilm".into(), ignore: vec![], extensions: vec![] };
        let result = plane.add_folder(req).unwrap();
        assert!(result.valid);
        assert_eq!(plane.list_folders().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_on_unmanaged_folder_returns_empty() {
        let manager = Arc::new(FolderManager::new(Arc::new(ModelRegistry::new(2))));
        let registry = Arc::new(ModelRegistry::new(2));
        let plane = ControlPlane::new(manager, registry, 3, ShutdownFlag::new());

        let req = SearchRequest { folder: PathBuf::from("/nowhere"), query_vector: vec![1.0], k: 5 };
        let hits = plane.search(req).await.unwrap();
        assert!(hits.is_empty());
    }

    // §4.K step 1: once shutdown has been marked, every method short-circuits
    // with ShuttingDown instead of reaching the manager or registry.
    #[tokio::test]
    async fn methods_reject_requests_once_shutting_down() {
        let manager = Arc::new(FolderManager::new(Arc::new(ModelRegistry::new(2))));
        let registry = Arc::new(ModelRegistry::new(2));
        let flag = ShutdownFlag::new();
        let plane = ControlPlane::new(manager, registry, 3, flag.clone());

        flag.mark_for_test();
        assert!(matches!(plane.validate_folder(Path::new("/tmp")), Err(ControlPlaneError::ShuttingDown)));
        assert!(matches!(plane.list_folders(), Err(ControlPlaneError::ShuttingDown)));
        assert!(matches!(plane.status().await, Err(ControlPlaneError::ShuttingDown)));
        let req = SearchRequest { folder: PathBuf::from("/nowhere"), query_vector: vec![1.0], k: 5 };
        assert!(matches!(plane.search(req).await, Err(ControlPlaneError::ShuttingDown)));
    }
}
