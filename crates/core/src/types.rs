//! Core domain types shared across storage, pipeline, and control-plane
//! boundaries (spec §3). Everything here is plain data: no I/O, no async.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A filesystem directory managed under a chosen embedding model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub path: PathBuf,
    pub model_id: String,
    pub display_name: String,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub created_at_unix_ms: i64,
    pub last_full_scan_unix_ms: Option<i64>,
}

impl Folder {
    pub fn new(path: PathBuf, model_id: impl Into<String>) -> Self {
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            path,
            model_id: model_id.into(),
            display_name,
            ignore_patterns: Vec::new(),
            extensions: Vec::new(),
            created_at_unix_ms: now_unix_ms(),
            last_full_scan_unix_ms: None,
        }
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Document format tag produced by the parse stage (§3 ParsedContent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
    Word,
    Spreadsheet,
    Presentation,
    Other,
}

impl DocumentFormat {
    /// Classify by extension. Parsers for non-text formats are out of scope
    /// (§1); this only decides which downstream handling applies.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Self::Markdown,
            "txt" | "text" | "rs" | "py" | "js" | "ts" | "json" | "toml" | "yaml" | "yml" => {
                Self::Text
            }
            "pdf" => Self::Pdf,
            "doc" | "docx" => Self::Word,
            "xls" | "xlsx" | "csv" => Self::Spreadsheet,
            "ppt" | "pptx" => Self::Presentation,
            _ => Self::Other,
        }
    }
}

/// Plain text extracted from a file, tagged with its source format.
/// Produced by "parse", consumed by "chunk", then discarded.
#[derive(Debug, Clone)]
pub struct ParsedContent {
    pub text: String,
    pub format: DocumentFormat,
}

/// A contiguous sub-range of a file's text (§3 Chunk).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_hash: String,
    pub ordinal: u32,
    pub start_offset: usize,
    pub end_offset: usize,
    pub token_estimate: u32,
    pub text: String,
}

/// A fixed-dimensional vector produced by a model for a chunk (§3 Embedding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub dim: usize,
}

/// A row in the `documents` table (§4.B).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub path: PathBuf,
    pub fingerprint_hash: String,
    pub size: u64,
    pub mtime_unix_ms: i64,
    pub last_indexed_unix_ms: Option<i64>,
    /// Authoritative when `Some`; otherwise the orchestrator falls back to
    /// fingerprint diff (spec §9 Open Question (b)).
    pub needs_reindex: Option<bool>,
    pub semantic_summary: Option<String>,
}

impl Document {
    /// Resolve whether this document requires reindexing, given the latest
    /// observed fingerprint hash. The stored `needs_reindex` flag wins when
    /// present; otherwise a hash mismatch is the signal.
    pub fn resolve_needs_reindex(&self, latest_hash: &str) -> bool {
        self.needs_reindex.unwrap_or(self.fingerprint_hash != latest_hash)
    }
}

/// Status of a single file-embedding task (§3 Task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Success,
    Error,
    Failed,
}

/// A file-embedding or tombstone task tracked by the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub file_path: PathBuf,
    pub content_hash: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at_unix_ms: Option<i64>,
    pub completed_at_unix_ms: Option<i64>,
    pub error_message: Option<String>,
    /// Earliest time this task is eligible for (re)dispatch.
    pub scheduled_at_unix_ms: i64,
    /// A deletion is modeled as a tombstone task (§4.G step 2).
    pub is_tombstone: bool,
}

impl Task {
    pub fn new(file_path: PathBuf, content_hash: String, max_retries: u32) -> Self {
        let now = now_unix_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path,
            content_hash,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            started_at_unix_ms: None,
            completed_at_unix_ms: None,
            error_message: None,
            scheduled_at_unix_ms: now,
            is_tombstone: false,
        }
    }

    pub fn tombstone(file_path: PathBuf) -> Self {
        let mut t = Self::new(file_path, String::new(), 0);
        t.is_tombstone = true;
        t
    }
}

/// Status of a folder, surfaced through the control plane (§3 FolderState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStatus {
    Scanning,
    Indexing,
    Active,
    Error,
}

/// Counters derived from the task queue, reported alongside [`FolderStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub pending: u32,
    pub in_progress: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub retrying: u32,
}

impl TaskCounters {
    pub fn total(&self) -> u32 {
        self.pending + self.in_progress + self.succeeded + self.failed + self.retrying
    }

    pub fn progress_percent(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        let done = self.succeeded + self.failed;
        (done as f32 / total as f32) * 100.0
    }
}

/// Full state snapshot for one folder (§3 FolderState, §4.H "events bubbled
/// up").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderState {
    pub status: FolderStatus,
    pub previous_status: Option<FolderStatus>,
    pub counters: TaskCounters,
    pub last_error: Option<String>,
}

impl Default for FolderState {
    fn default() -> Self {
        Self {
            status: FolderStatus::Scanning,
            previous_status: None,
            counters: TaskCounters::default(),
            last_error: None,
        }
    }
}

/// Search hit shape returned by the control plane (§6 "Search hits").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_path: PathBuf,
    pub chunk_ordinal: u32,
    pub similarity: f32,
    pub preview: String,
    pub location: String,
}

/// The on-disk daemon singleton claim (§3 DaemonRegistryRecord, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRegistryRecord {
    pub pid: u32,
    pub control_ports: Vec<u16>,
    pub start_time_unix_ms: i64,
    pub version: String,
}
