//! Folder Lifecycle Orchestrator (spec §4.G) — one per managed folder.
//!
//! Grounded on `codescope::watch.rs`'s debounce-and-reprocess loop,
//! generalized from "one watched tree, ad hoc re-scan" into "one state
//! machine per folder, explicit scan → index → active transitions", and on
//! `main.rs`'s per-repo construction (`repo_specs.par_iter().map(...)`)
//! generalized into the manager's `path → Orchestrator` map (§4.H).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use folderd_core::chunk::ChunkParams;
use folderd_core::error::{ValidationIssue, ValidationResult};
use folderd_core::path::{fingerprint, is_sub_path, normalize, walk};
use folderd_core::storage::Storage;
use folderd_core::types::{FolderState, FolderStatus, Task};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::embedder::ModelHandle;
use crate::error::FatalInternalError;
use crate::lifecycle::LifecycleMachine;
use crate::model_registry::ModelRegistry;
use crate::pipeline::{process_file, StageRetryPolicy};
use crate::task_queue::TaskQueue;
use crate::watcher::FolderWatcher;

/// Drive a transition that the calling code's own logic guarantees is
/// legal. A `false` return means an invariant was violated by a bug in this
/// module, not by any external input — per §7, that's a [`FatalInternalError`],
/// not a recoverable error, so this crashes with a structured report rather
/// than silently continuing in an inconsistent state.
fn transition_or_panic(machine: &mut LifecycleMachine, target: FolderStatus) {
    if !machine.transition_to(target) {
        panic!(
            "{}",
            FatalInternalError::IllegalTransition(format!("{:?} -> {target:?}", machine.current()))
        );
    }
}

/// Per-folder configuration the orchestrator needs to run a scan/index
/// cycle (a narrowed view of [`folderd_core::config::FolderConfig`] plus
/// the processing knobs that apply to it).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub root: PathBuf,
    pub model_id: String,
    pub ignore_patterns: Vec<String>,
    pub extensions: Vec<String>,
    pub max_concurrent: usize,
    pub chunk_params: ChunkParams,
}

/// Validate a candidate folder path against the set of already-managed
/// roots (§4.G validation contract).
pub fn validate_folder(candidate: &Path, existing: &[PathBuf]) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !candidate.exists() {
        result.errors.push(ValidationIssue::not_exists(candidate));
        return result;
    }
    if !candidate.is_dir() {
        result.errors.push(ValidationIssue::not_directory(candidate));
        return result;
    }

    // Subfolder takes priority over exact duplicate: a path that is both an
    // exact match for one managed folder and a strict descendant of another
    // is reported as SUBFOLDER (the descendant relationship is the more
    // actionable error of the two).
    let candidate = normalize(candidate);
    if let Some(parent) = existing.iter().find(|p| is_sub_path(&candidate, p)) {
        result.errors.push(ValidationIssue::subfolder(&candidate, parent));
        return result;
    }
    if existing.iter().any(|p| normalize(p) == candidate) {
        result.errors.push(ValidationIssue::duplicate(&candidate));
        return result;
    }
    let affected: Vec<PathBuf> = existing.iter().filter(|p| is_sub_path(p, &candidate)).cloned().collect();
    if !affected.is_empty() {
        result.warnings.push(ValidationIssue::ancestor(&candidate, affected));
    }
    result.valid = true;
    result
}

/// Drives the per-folder scan → index → active → (re-scan | error) loop.
pub struct Orchestrator {
    config: OrchestratorConfig,
    storage: Arc<Mutex<Storage>>,
    registry: Arc<ModelRegistry>,
    state_tx: watch::Sender<FolderState>,
    pub state_rx: watch::Receiver<FolderState>,
    cancel: CancellationToken,
    /// Kept alive only for as long as this folder is watched; dropping it
    /// (on [`Self::dispose`]) stops the underlying `notify` watcher.
    watcher: std::sync::Mutex<Option<FolderWatcher>>,
    /// Persists across cycles so that `error` survives until an explicit
    /// [`Self::retry`] (§4.F "error -> scanning: explicit 'retry' from
    /// control plane") rather than being forgotten and silently re-entered
    /// on the very next watch event or poll tick.
    machine: Mutex<LifecycleMachine>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, registry: Arc<ModelRegistry>) -> Result<Self, folderd_core::error::StorageError> {
        let storage = Storage::open(&config.root)?;
        let (state_tx, state_rx) = watch::channel(FolderState::default());
        Ok(Self {
            config,
            storage: Arc::new(Mutex::new(storage)),
            registry,
            state_tx,
            state_rx,
            cancel: CancellationToken::new(),
            watcher: std::sync::Mutex::new(None),
            machine: Mutex::new(LifecycleMachine::new()),
        })
    }

    /// Start watching this folder's tree for changes and trigger a
    /// scan/index cycle on every settled [`crate::watcher::ChangeEvent`]
    /// (§4.L feeding §4.G's re-scan trigger). Idempotent: a second call
    /// replaces the previous watch.
    pub fn start_watching(self: &Arc<Self>) -> Result<(), notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = FolderWatcher::start(self.config.root.clone(), tx)?;
        *self.watcher.lock().unwrap() = Some(watcher);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(_event) = rx.recv().await {
                let Some(orchestrator) = weak.upgrade() else { break };
                if orchestrator.cancel.is_cancelled() {
                    break;
                }
                // A watch event names one changed file, so route its embed
                // calls ahead of any batch scan already queued (§4.C).
                if let Err(e) = orchestrator.run_cycle(true).await {
                    warn!(error = %e, "watch-triggered rescan failed");
                }
            }
        });
        Ok(())
    }

    fn publish(&self, machine: &LifecycleMachine, queue: &TaskQueue, last_error: Option<String>) {
        let _ = self.state_tx.send(FolderState {
            status: machine.current(),
            previous_status: machine.previous(),
            counters: queue.stats(),
            last_error,
        });
    }

    /// Run one full scan → index → active cycle (§4.G steps 1-5). Invoked
    /// both by the manager's periodic poll and by [`Self::start_watching`]'s
    /// change-triggered rescans. A folder parked in `error` stays there —
    /// this returns immediately without touching the machine — until
    /// [`Self::retry`] moves it back to `scanning`. `immediate` is forwarded
    /// to every embed call in this cycle (§4.C priority rule) — set for
    /// single-file watch rescans, unset for the periodic bulk poll.
    pub async fn run_cycle(&self, immediate: bool) -> Result<(), folderd_core::error::StorageError> {
        let mut machine = self.machine.lock().await;
        if machine.current() == FolderStatus::Error {
            debug!(folder = %self.config.root.display(), "folder is in error state, cycle skipped until retry");
            return Ok(());
        }

        let mut queue = TaskQueue::new(self.config.max_concurrent);
        if machine.current() == FolderStatus::Active {
            transition_or_panic(&mut machine, FolderStatus::Scanning);
        }
        self.publish(&machine, &queue, None);

        let diffs = self.diff_against_storage().await?;
        if diffs.is_empty() {
            transition_or_panic(&mut machine, FolderStatus::Active);
            self.publish(&machine, &queue, None);
            return Ok(());
        }

        transition_or_panic(&mut machine, FolderStatus::Indexing);
        queue.add_tasks(diffs);
        self.publish(&machine, &queue, None);

        let model = match self.registry.get_or_load(&self.config.model_id).await {
            Ok(m) => m,
            Err(e) => {
                transition_or_panic(&mut machine, FolderStatus::Error);
                self.publish(&machine, &queue, Some(e.to_string()));
                return Ok(());
            }
        };

        self.drain_queue(&mut queue, &model, immediate).await;

        if queue.is_drained() {
            transition_or_panic(&mut machine, FolderStatus::Active);
        } else {
            transition_or_panic(&mut machine, FolderStatus::Error);
        }
        self.publish(&machine, &queue, None);
        Ok(())
    }

    async fn diff_against_storage(&self) -> Result<Vec<Task>, folderd_core::error::StorageError> {
        let files = walk(&self.config.root, &self.config.extensions, &self.config.ignore_patterns)
            .map_err(|e| folderd_core::error::StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let storage = self.storage.lock().await;
        let mut tasks = Vec::new();
        for path in &files {
            let fp = match fingerprint(path) {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to fingerprint file during scan");
                    continue;
                }
            };
            let existing = storage.get_document(path)?;
            let needs_reindex = match &existing {
                Some(doc) => doc.resolve_needs_reindex(&fp.hash),
                None => true,
            };
            if needs_reindex {
                tasks.push(Task::new(path.clone(), fp.hash, self.default_max_retries()));
            }
        }

        let known_paths: Vec<PathBuf> = storage.list_documents()?.into_iter().map(|d| d.path).collect();
        for known in known_paths {
            if !files.contains(&known) {
                tasks.push(Task::tombstone(known));
            }
        }

        Ok(tasks)
    }

    fn default_max_retries(&self) -> u32 {
        StageRetryPolicy::default().embed
    }

    async fn drain_queue(&self, queue: &mut TaskQueue, model: &ModelHandle, immediate: bool) {
        while !queue.is_drained() {
            if self.cancel.is_cancelled() {
                debug!(folder = %self.config.root.display(), "orchestrator cancelled mid-drain");
                queue.clear_all();
                return;
            }

            let Some(task) = queue.next_task() else {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                continue;
            };

            if task.is_tombstone {
                let mut storage = self.storage.lock().await;
                let _ = storage.remove_document(&task.file_path);
                queue.update_status(task, folderd_core::types::TaskStatus::Success, None);
                continue;
            }

            let result = process_file(
                &self.storage,
                &self.registry,
                model,
                &task.file_path,
                &self.config.extensions,
                self.config.chunk_params,
                StageRetryPolicy::default(),
                immediate,
            )
            .await;

            match result {
                Ok(()) => queue.update_status(task, folderd_core::types::TaskStatus::Success, None),
                Err(e) => {
                    info!(file = %task.file_path.display(), stage = e.stage_name(), error = %e, "pipeline stage failed");
                    queue.update_status(task, folderd_core::types::TaskStatus::Error, Some(e.to_string()));
                }
            }
        }
    }

    /// Re-enter `scanning` from `error` (§4.F "error -> scanning: explicit
    /// 'retry' from control plane") — the only way out of `error`; nothing
    /// else ever calls this transition. Returns `false` if the folder
    /// wasn't actually in `error`, or if a cycle is running concurrently.
    pub fn retry(&self) -> bool {
        let Ok(mut machine) = self.machine.try_lock() else { return false };
        if machine.current() != FolderStatus::Error {
            return false;
        }
        transition_or_panic(&mut machine, FolderStatus::Scanning);
        self.publish(&machine, &TaskQueue::new(self.config.max_concurrent), None);
        true
    }

    /// Signal all in-flight work to stop at the next safe point, drain to
    /// terminal states, and release the storage handle (§4.G cancellation
    /// contract). After `dispose`, no further state change is published.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        *self.watcher.lock().unwrap() = None;
    }

    /// Run a similarity search against this folder's store and dress each
    /// raw hit with the owning document path and a short text preview (§6
    /// "Search hits").
    pub async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<folderd_core::types::SearchHit>, folderd_core::error::StorageError> {
        let storage = self.storage.lock().await;
        let scored = storage.search(query_vector, k)?;

        let mut hits = Vec::with_capacity(scored.len());
        for s in scored {
            let Some((document_path, chunk)) = storage.get_chunk(&s.chunk_id)? else { continue };
            let preview: String = chunk.text.chars().take(200).collect();
            hits.push(folderd_core::types::SearchHit {
                document_path: document_path.clone(),
                chunk_ordinal: chunk.ordinal,
                similarity: s.similarity,
                preview,
                location: format!("{}#{}", document_path.display(), chunk.ordinal),
            });
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "illegal state transition")]
    fn transition_or_panic_crashes_on_illegal_transition() {
        let mut machine = LifecycleMachine::new();
        transition_or_panic(&mut machine, FolderStatus::Scanning);
    }

    #[test]
    fn validate_rejects_missing_path() {
        let result = validate_folder(Path::new("/does/not/exist/at/all"), &[]);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn validate_accepts_ancestor_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let child = dir.path().join("docs");
        std::fs::create_dir(&child).unwrap();
        let child = child.canonicalize().unwrap();

        let result = validate_folder(dir.path(), &[child.clone()]);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].affected, vec![child]);
    }

    #[test]
    fn validate_rejects_subfolder_of_existing() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().canonicalize().unwrap();
        let child = parent.join("docs");
        std::fs::create_dir(&child).unwrap();

        let result = validate_folder(&child, &[parent]);
        assert!(!result.valid);
        assert_eq!(result.errors[0].code, folderd_core::error::ValidationCode::Subfolder);
    }

    #[test]
    fn validate_rejects_exact_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap();
        let result = validate_folder(&path, &[path.clone()]);
        assert!(!result.valid);
        assert_eq!(result.errors[0].code, folderd_core::error::ValidationCode::Duplicate);
    }

    #[tokio::test]
    async fn search_dresses_raw_hits_with_document_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            root: dir.path().to_path_buf(),
            model_id: "minilm".to_string(),
            ignore_patterns: vec![],
            extensions: vec!["txt".to_string()],
            max_concurrent: 2,
            chunk_params: ChunkParams::default(),
        };
        let orchestrator = Orchestrator::new(config, Arc::new(ModelRegistry::new(2))).unwrap();

        let doc_path = dir.path().join("a.txt");
        {
            let mut storage = orchestrator.storage.lock().await;
            let doc = folderd_core::types::Document {
                path: doc_path.clone(),
                fingerprint_hash: "h".into(),
                size: 5,
                mtime_unix_ms: 0,
                last_indexed_unix_ms: None,
                needs_reindex: Some(false),
                semantic_summary: None,
            };
            storage.upsert_document(&doc).unwrap();
            let chunk = folderd_core::types::Chunk {
                id: "a.txt:0".into(),
                document_hash: "h".into(),
                ordinal: 0,
                start_offset: 0,
                end_offset: 5,
                token_estimate: 2,
                text: "hello".into(),
            };
            let embedding = folderd_core::types::Embedding {
                chunk_id: "a.txt:0".into(),
                vector: vec![1.0, 0.0],
                model_id: "minilm".into(),
                dim: 2,
            };
            storage.persist_chunks(&doc_path, &[chunk], &[embedding]).unwrap();
        }

        let hits = orchestrator.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_path, doc_path);
        assert_eq!(hits[0].preview, "hello");
    }

    fn orchestrator_for_test(dir: &std::path::Path) -> Orchestrator {
        let config = OrchestratorConfig {
            root: dir.to_path_buf(),
            model_id: "minilm".to_string(),
            ignore_patterns: vec![],
            extensions: vec!["txt".to_string()],
            max_concurrent: 2,
            chunk_params: ChunkParams::default(),
        };
        Orchestrator::new(config, Arc::new(ModelRegistry::new(2))).unwrap()
    }

    #[tokio::test]
    async fn retry_moves_error_back_to_scanning() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for_test(dir.path());
        transition_or_panic(&mut *orchestrator.machine.lock().await, FolderStatus::Indexing);
        transition_or_panic(&mut *orchestrator.machine.lock().await, FolderStatus::Error);

        assert!(orchestrator.retry());
        assert_eq!(orchestrator.machine.lock().await.current(), FolderStatus::Scanning);
        assert_eq!(orchestrator.state_rx.borrow().status, FolderStatus::Scanning);
    }

    #[tokio::test]
    async fn retry_is_a_noop_outside_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for_test(dir.path());
        assert_eq!(orchestrator.machine.lock().await.current(), FolderStatus::Scanning);
        assert!(!orchestrator.retry());
    }

    // An errored folder must not silently heal on the next cycle; only an
    // explicit retry() moves it back to scanning.
    #[tokio::test]
    async fn run_cycle_is_a_noop_while_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for_test(dir.path());
        transition_or_panic(&mut *orchestrator.machine.lock().await, FolderStatus::Indexing);
        transition_or_panic(&mut *orchestrator.machine.lock().await, FolderStatus::Error);

        orchestrator.run_cycle(false).await.unwrap();
        assert_eq!(orchestrator.machine.lock().await.current(), FolderStatus::Error);

        assert!(orchestrator.retry());
        orchestrator.run_cycle(false).await.unwrap();
        assert_eq!(orchestrator.machine.lock().await.current(), FolderStatus::Active);
    }
}
