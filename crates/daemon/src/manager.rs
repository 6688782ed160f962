//! Folder Lifecycle Manager (spec §4.H).
//!
//! Owns the `path → Orchestrator` map, generalized from `codescope::main.rs`'s
//! per-repo construction loop (`repo_specs.par_iter().map(scan_repo_with_options)`)
//! into a long-lived daemon-scoped registry instead of a one-shot build step.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use folderd_core::config::FolderConfig;
use folderd_core::error::{StorageError, ValidationResult};
use tracing::{info, warn};

use crate::model_registry::ModelRegistry;
use crate::orchestrator::{validate_folder, Orchestrator, OrchestratorConfig};

/// Event bubbled up to subscribers on folder state change (§4.H "Events
/// bubbled up").
#[derive(Debug, Clone)]
pub struct FolderEvent {
    pub folder_path: PathBuf,
    pub status: folderd_core::types::FolderStatus,
    pub counters: folderd_core::types::TaskCounters,
    pub last_error: Option<String>,
}

/// Owns every orchestrator for the lifetime of the daemon. `StartFolder` is
/// idempotent on the same path; `StopAll` disposes every orchestrator in
/// parallel and clears the map (§4.H).
pub struct FolderManager {
    orchestrators: DashMap<PathBuf, Arc<Orchestrator>>,
    registry: Arc<ModelRegistry>,
}

impl FolderManager {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { orchestrators: DashMap::new(), registry }
    }

    pub fn validate(&self, path: &Path) -> ValidationResult {
        let existing: Vec<PathBuf> = self.orchestrators.iter().map(|e| e.key().clone()).collect();
        validate_folder(path, &existing)
    }

    /// Construct a storage handle and orchestrator for `cfg` and start its
    /// scan loop. A no-op if the path is already managed.
    pub fn start_folder(&self, cfg: &FolderConfig, max_concurrent: usize) -> Result<(), StorageError> {
        let path = folderd_core::path::normalize(&cfg.path);
        if self.orchestrators.contains_key(&path) {
            return Ok(());
        }

        let orchestrator_cfg = OrchestratorConfig {
            root: path.clone(),
            model_id: cfg.model.clone(),
            ignore_patterns: cfg.ignore.clone(),
            extensions: cfg.extensions.clone(),
            max_concurrent,
            chunk_params: folderd_core::chunk::ChunkParams::default(),
        };

        let orchestrator = Arc::new(Orchestrator::new(orchestrator_cfg, Arc::clone(&self.registry))?);
        if let Err(e) = orchestrator.start_watching() {
            warn!(folder = %path.display(), error = %e, "failed to start filesystem watcher, relying on periodic scan only");
        }
        self.orchestrators.insert(path.clone(), orchestrator);
        info!(folder = %path.display(), "folder started");
        Ok(())
    }

    pub async fn stop_folder(&self, path: &Path) {
        let path = folderd_core::path::normalize(path);
        if let Some((_, orchestrator)) = self.orchestrators.remove(&path) {
            orchestrator.dispose().await;
            info!(folder = %path.display(), "folder stopped");
        }
    }

    /// Dispose every orchestrator concurrently and clear the map (§4.H
    /// `StopAll`).
    pub async fn stop_all(&self) {
        let handles: Vec<Arc<Orchestrator>> = self.orchestrators.iter().map(|e| Arc::clone(e.value())).collect();
        let futures: Vec<_> = handles.iter().map(|o| o.dispose()).collect();
        futures::future::join_all(futures).await;
        self.orchestrators.clear();
        warn!("all folders stopped");
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Orchestrator>> {
        let path = folderd_core::path::normalize(path);
        self.orchestrators.get(&path).map(|e| Arc::clone(e.value()))
    }

    pub fn list_paths(&self) -> Vec<PathBuf> {
        self.orchestrators.iter().map(|e| e.key().clone()).collect()
    }

    pub fn managed_count(&self) -> usize {
        self.orchestrators.len()
    }

    pub async fn run_all_cycles(&self) -> HashMap<PathBuf, Result<(), StorageError>> {
        let mut results = HashMap::new();
        for entry in self.orchestrators.iter() {
            let path = entry.key().clone();
            let orchestrator = Arc::clone(entry.value());
            let outcome = orchestrator.run_cycle(false).await;
            results.insert(path, outcome);
        }
        results
    }
}
