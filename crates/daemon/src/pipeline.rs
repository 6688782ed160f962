//! Indexing pipeline: parse → chunk → embed → persist (spec §4.D).
//!
//! New relative to `codescope` (one `build_semantic_index` pass, no stage
//! retries). Grounded on the stage shape implied by `codescope`'s own
//! scan → chunk → embed flow, generalized into explicit per-stage retry
//! budgets with exponential backoff — the same `base · 2^attempts` shape
//! the otters daemon lifecycle reference and the process supervisor (§4.J)
//! both use.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use folderd_core::chunk::{extract_chunks, is_extension_allowed, parse_as_text, ChunkParams};
use folderd_core::error::StorageError;
use folderd_core::path::fingerprint;
use folderd_core::storage::Storage;
use folderd_core::types::{now_unix_ms, Document, Embedding};

use crate::embedder::ModelHandle;
use crate::error::ModelError;
use crate::model_registry::ModelRegistry;

/// `(canRetry, maxRetries)` per stage, with the recommended defaults from
/// §4.D.
#[derive(Debug, Clone, Copy)]
pub struct StageRetryPolicy {
    pub parse: u32,
    pub chunk: u32,
    pub embed: u32,
    pub persist: u32,
}

impl Default for StageRetryPolicy {
    fn default() -> Self {
        Self { parse: 2, chunk: 1, embed: 3, persist: 2 }
    }
}

/// Exponential backoff with base 1s and factor 2 (§4.D).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("parse failed after retries: {0}")]
    Parse(String),
    #[error("chunk failed after retries: {0}")]
    Chunk(String),
    #[error("embed failed after retries: {0}")]
    Embed(#[from] ModelError),
    #[error("persist failed after retries: {0}")]
    Persist(#[from] StorageError),
}

impl PipelineError {
    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Chunk(_) => "chunk",
            Self::Embed(_) => "embed",
            Self::Persist(_) => "persist",
        }
    }
}

/// Process one file end to end. On success, chunks and embeddings are
/// persisted atomically and the document row is marked indexed with the
/// current fingerprint. On failure, no partial artifacts are persisted
/// (§4.D per-file contract). `immediate` routes the embed call ahead of
/// queued batch inference in the registry (§4.C priority rule); the
/// orchestrator sets it for watch-triggered rescans of a single file and
/// leaves it unset for a folder's initial bulk scan.
pub async fn process_file(
    storage: &Arc<tokio::sync::Mutex<Storage>>,
    registry: &ModelRegistry,
    model: &ModelHandle,
    path: &Path,
    allowed_extensions: &[String],
    chunk_params: ChunkParams,
    retries: StageRetryPolicy,
    immediate: bool,
) -> Result<(), PipelineError> {
    if !is_extension_allowed(path, allowed_extensions) {
        return Ok(());
    }

    let fp = retry(retries.parse, || fingerprint(path).map_err(|e| e.to_string()))
        .await
        .map_err(PipelineError::Parse)?;

    let content = retry(retries.parse, || parse_as_text(path).map_err(|e| e.to_string()))
        .await
        .map_err(PipelineError::Parse)?;

    let chunks = retry(retries.chunk, || Ok(extract_chunks(&fp.hash, &content, chunk_params)))
        .await
        .map_err(PipelineError::Chunk)?;

    // Chunk ids are "{document_hash}:{ordinal}" (§3 FileFingerprint), so a
    // different document with byte-identical content produces the exact
    // same ids here. If that document was already embedded with this same
    // model, reuse its vectors instead of re-running inference.
    let reused = {
        let storage = storage.lock().await;
        storage.find_embeddings_by_hash(&fp.hash).map_err(PipelineError::Persist)?
    };
    let embeddings: Vec<Embedding> = if reused.len() == chunks.len()
        && reused.iter().all(|(_, e)| e.model_id == model.model_id)
    {
        reused.into_iter().map(|(_, e)| e).collect()
    } else {
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = if texts.iter().all(|t| t.is_empty()) {
            vec![vec![0.0f32; model.dim]; texts.len()]
        } else {
            retry_async(retries.embed, || async { registry.encode_with_priority(model, &texts, immediate).await }).await?
        };
        chunks
            .iter()
            .zip(vectors)
            .map(|(c, v)| Embedding { chunk_id: c.id.clone(), vector: v, model_id: model.model_id.clone(), dim: model.dim })
            .collect()
    };

    let document = Document {
        path: path.to_path_buf(),
        fingerprint_hash: fp.hash,
        size: fp.size,
        mtime_unix_ms: fp.mtime_unix_ms,
        last_indexed_unix_ms: Some(now_unix_ms()),
        needs_reindex: Some(false),
        semantic_summary: None,
    };

    {
        let mut storage = storage.lock().await;
        storage.upsert_document(&document).map_err(PipelineError::Persist)?;
        storage.persist_chunks(path, &chunks, &embeddings).map_err(PipelineError::Persist)?;
    }

    Ok(())
}

async fn retry<T>(max_retries: u32, mut f: impl FnMut() -> Result<T, String>) -> Result<T, String> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max_retries {
                    return Err(e);
                }
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}

async fn retry_async<T, E, Fut>(max_retries: u32, mut f: impl FnMut() -> Fut) -> Result<T, E>
where
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max_retries {
                    return Err(e);
                }
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}
