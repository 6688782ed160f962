//! Per-folder storage engine (spec §4.B).
//!
//! No comparable upstream component exists — `codescope` rebuilds its whole
//! index in memory on every process start. Grounded instead on the embedded-SQLite
//! pattern shared by the semantically-closest retrieval examples
//! (`rusqlite` with the `bundled` feature). One SQLite file lives under each
//! folder's metadata directory; `Search` is a brute-force cosine scan over
//! the `embeddings` table, matching the linear scan `codescope::semantic.rs`
//! already performs over its in-memory vectors — the similarity index
//! implementation itself is out of scope (§1).

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::types::{Chunk, Document, Embedding};

pub const METADATA_DIR_NAME: &str = ".folderd";
const DB_FILE_NAME: &str = "index.sqlite3";

/// Aggregate counts for a folder's store (§4.B `Stats()`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    pub document_count: u64,
    pub embedding_count: u64,
    pub approx_size_bytes: u64,
}

/// A single `Search` hit before it is dressed up into a control-plane
/// [`crate::types::SearchHit`].
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub similarity: f32,
}

/// Owns one SQLite connection scoped to a folder's metadata directory.
/// Every mutation that touches more than one table runs inside an explicit
/// transaction so readers never observe a torn write.
#[derive(Debug)]
pub struct Storage {
    conn: Connection,
    db_path: PathBuf,
}

impl Storage {
    /// Open (creating if absent) the store under `folder_root`'s metadata
    /// directory. A `PRAGMA` failure or unreadable header is treated as
    /// corruption per §4.B ("fails the folder into the error state rather
    /// than silently truncating").
    pub fn open(folder_root: &Path) -> Result<Self, StorageError> {
        let meta_dir = folder_root.join(METADATA_DIR_NAME);
        std::fs::create_dir_all(&meta_dir)?;
        let db_path = meta_dir.join(DB_FILE_NAME);
        Self::open_at(&db_path)
    }

    /// Open a store at an explicit database path (used directly by tests).
    pub fn open_at(db_path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(|e| classify_open_error(db_path, e))?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| classify_open_error(db_path, e))?;
        let storage = Self { conn, db_path: db_path.to_path_buf() };
        storage.run_migrations().map_err(|_| classify_open_error(db_path, rusqlite::Error::InvalidQuery))?;
        Ok(storage)
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                last_indexed INTEGER,
                needs_reindex INTEGER,
                semantic_summary TEXT
            );
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_path TEXT NOT NULL REFERENCES documents(path) ON DELETE CASCADE,
                document_hash TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                token_estimate INTEGER NOT NULL,
                text TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS embeddings (
                chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
                vector BLOB NOT NULL,
                model_id TEXT NOT NULL,
                dim INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_document_path ON chunks(document_path);
            CREATE INDEX IF NOT EXISTS idx_chunks_document_hash ON chunks(document_hash);",
        )?;
        Ok(())
    }

    /// Idempotent upsert keyed by path. When the fingerprint changes, the
    /// prior chunks and embeddings are removed in the same transaction
    /// (§4.B `UpsertDocument` contract).
    pub fn upsert_document(&mut self, doc: &Document) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let prior_fingerprint: Option<String> = tx
            .query_row("SELECT fingerprint FROM documents WHERE path = ?1", params![path_key(&doc.path)], |row| {
                row.get(0)
            })
            .optional()?;

        if let Some(prior) = &prior_fingerprint {
            if prior != &doc.fingerprint_hash {
                tx.execute("DELETE FROM chunks WHERE document_path = ?1", params![path_key(&doc.path)])?;
            }
        }

        tx.execute(
            "INSERT INTO documents (path, fingerprint, size, mtime, last_indexed, needs_reindex, semantic_summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                size = excluded.size,
                mtime = excluded.mtime,
                last_indexed = excluded.last_indexed,
                needs_reindex = excluded.needs_reindex,
                semantic_summary = excluded.semantic_summary",
            params![
                path_key(&doc.path),
                doc.fingerprint_hash,
                doc.size as i64,
                doc.mtime_unix_ms,
                doc.last_indexed_unix_ms,
                doc.needs_reindex,
                doc.semantic_summary,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist all chunks and embeddings for one file atomically (§4.D
    /// per-file contract: "all chunks for the file are persisted
    /// atomically").
    pub fn persist_chunks(
        &mut self,
        document_path: &Path,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE document_path = ?1", params![path_key(document_path)])?;
        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks (id, document_path, document_hash, ordinal, start_offset, end_offset, token_estimate, text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    document_path = excluded.document_path,
                    document_hash = excluded.document_hash,
                    ordinal = excluded.ordinal,
                    start_offset = excluded.start_offset,
                    end_offset = excluded.end_offset,
                    token_estimate = excluded.token_estimate,
                    text = excluded.text",
                params![
                    chunk.id,
                    path_key(document_path),
                    chunk.document_hash,
                    chunk.ordinal,
                    chunk.start_offset as i64,
                    chunk.end_offset as i64,
                    chunk.token_estimate,
                    chunk.text,
                ],
            )?;
        }
        for embedding in embeddings {
            tx.execute(
                "INSERT INTO embeddings (chunk_id, vector, model_id, dim)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chunk_id) DO UPDATE SET vector = excluded.vector, model_id = excluded.model_id, dim = excluded.dim",
                params![embedding.chunk_id, encode_vector(&embedding.vector), embedding.model_id, embedding.dim],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_document(&self, path: &Path) -> Result<Option<Document>, StorageError> {
        self.conn
            .query_row(
                "SELECT path, fingerprint, size, mtime, last_indexed, needs_reindex, semantic_summary
                 FROM documents WHERE path = ?1",
                params![path_key(path)],
                row_to_document,
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn list_documents(&self) -> Result<Vec<Document>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT path, fingerprint, size, mtime, last_indexed, needs_reindex, semantic_summary FROM documents",
        )?;
        let rows = stmt.query_map([], row_to_document)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn remove_document(&mut self, path: &Path) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM documents WHERE path = ?1", params![path_key(path)])?;
        Ok(())
    }

    /// Look up every already-embedded chunk sharing `document_hash`,
    /// ordered by ordinal (§3 `FileFingerprint` invariant: "two files with
    /// same hash may reuse embeddings"). Returns an empty vec if no document
    /// has ever been embedded with this content.
    pub fn find_embeddings_by_hash(&self, document_hash: &str) -> Result<Vec<(Chunk, Embedding)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.document_hash, c.ordinal, c.start_offset, c.end_offset, c.token_estimate, c.text,
                    e.vector, e.model_id, e.dim
             FROM chunks c JOIN embeddings e ON e.chunk_id = c.id
             WHERE c.document_hash = ?1
             ORDER BY c.ordinal ASC",
        )?;
        let rows = stmt.query_map(params![document_hash], |row| {
            let raw: Vec<u8> = row.get(7)?;
            Ok((
                Chunk {
                    id: row.get(0)?,
                    document_hash: row.get(1)?,
                    ordinal: row.get(2)?,
                    start_offset: row.get::<_, i64>(3)? as usize,
                    end_offset: row.get::<_, i64>(4)? as usize,
                    token_estimate: row.get(5)?,
                    text: row.get(6)?,
                },
                Embedding { chunk_id: row.get(0)?, vector: decode_vector(&raw), model_id: row.get(8)?, dim: row.get(9)? },
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    /// Look up one chunk by id along with the path of the document it
    /// belongs to, used to dress a [`ScoredChunk`] up into a
    /// control-plane-facing hit (document path, ordinal, preview text).
    pub fn get_chunk(&self, chunk_id: &str) -> Result<Option<(PathBuf, Chunk)>, StorageError> {
        self.conn
            .query_row(
                "SELECT id, document_path, document_hash, ordinal, start_offset, end_offset, token_estimate, text
                 FROM chunks WHERE id = ?1",
                params![chunk_id],
                |row| {
                    let document_path: String = row.get(1)?;
                    Ok((
                        PathBuf::from(document_path),
                        Chunk {
                            id: row.get(0)?,
                            document_hash: row.get(2)?,
                            ordinal: row.get(3)?,
                            start_offset: row.get::<_, i64>(4)? as usize,
                            end_offset: row.get::<_, i64>(5)? as usize,
                            token_estimate: row.get(6)?,
                            text: row.get(7)?,
                        },
                    ))
                },
            )
            .optional()
            .map_err(StorageError::from)
    }

    /// Top-k by cosine similarity, ties broken by chunk id ascending (§4.B
    /// `Search` contract). Brute-force: loads every embedding for the
    /// folder's store, which is appropriate at per-folder scale.
    pub fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT chunk_id, vector FROM embeddings")?;
        let rows = stmt.query_map([], |row| {
            let chunk_id: String = row.get(0)?;
            let raw: Vec<u8> = row.get(1)?;
            Ok((chunk_id, decode_vector(&raw)))
        })?;

        let mut scored: Vec<ScoredChunk> = Vec::new();
        for row in rows {
            let (chunk_id, vector) = row?;
            let similarity = cosine_similarity(query_vector, &vector);
            scored.push(ScoredChunk { chunk_id, similarity });
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let document_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
        let embedding_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
        let approx_size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        Ok(StorageStats {
            document_count: document_count as u64,
            embedding_count: embedding_count as u64,
            approx_size_bytes,
        })
    }
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let path: String = row.get(0)?;
    Ok(Document {
        path: PathBuf::from(path),
        fingerprint_hash: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mtime_unix_ms: row.get(3)?,
        last_indexed_unix_ms: row.get(4)?,
        needs_reindex: row.get(5)?,
        semantic_summary: row.get(6)?,
    })
}

fn classify_open_error(path: &Path, e: rusqlite::Error) -> StorageError {
    StorageError::Corrupt { path: path.to_path_buf(), reason: e.to_string() }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return -1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_document(path: &str, fingerprint: &str) -> Document {
        Document {
            path: PathBuf::from(path),
            fingerprint_hash: fingerprint.to_string(),
            size: 10,
            mtime_unix_ms: 0,
            last_indexed_unix_ms: Some(0),
            needs_reindex: None,
            semantic_summary: None,
        }
    }

    #[test]
    fn upsert_document_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(dir.path()).unwrap();
        let doc = sample_document("a.txt", "hash1");

        storage.upsert_document(&doc).unwrap();
        storage.upsert_document(&doc).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.document_count, 1);
    }

    #[test]
    fn fingerprint_change_clears_prior_chunks() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(dir.path()).unwrap();
        let mut doc = sample_document("a.txt", "hash1");

        let chunk = Chunk {
            id: "a.txt:0".to_string(),
            document_hash: "hash1".to_string(),
            ordinal: 0,
            start_offset: 0,
            end_offset: 5,
            token_estimate: 2,
            text: "hello".to_string(),
        };
        let embedding = Embedding {
            chunk_id: "a.txt:0".to_string(),
            vector: vec![1.0, 0.0],
            model_id: "m1".to_string(),
            dim: 2,
        };

        storage.upsert_document(&doc).unwrap();
        storage.persist_chunks(&doc.path, &[chunk], &[embedding]).unwrap();
        assert_eq!(storage.stats().unwrap().embedding_count, 1);

        doc.fingerprint_hash = "hash2".to_string();
        storage.upsert_document(&doc).unwrap();
        assert_eq!(storage.stats().unwrap().embedding_count, 0);
    }

    #[test]
    fn search_returns_top_k_by_similarity_with_id_tiebreak() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(dir.path()).unwrap();
        let doc = sample_document("a.txt", "hash1");
        storage.upsert_document(&doc).unwrap();

        let chunks = vec![
            Chunk { id: "a.txt:0".into(), document_hash: "hash1".into(), ordinal: 0, start_offset: 0, end_offset: 1, token_estimate: 1, text: "x".into() },
            Chunk { id: "a.txt:1".into(), document_hash: "hash1".into(), ordinal: 1, start_offset: 1, end_offset: 2, token_estimate: 1, text: "y".into() },
        ];
        let embeddings = vec![
            Embedding { chunk_id: "a.txt:0".into(), vector: vec![1.0, 0.0], model_id: "m1".into(), dim: 2 },
            Embedding { chunk_id: "a.txt:1".into(), vector: vec![1.0, 0.0], model_id: "m1".into(), dim: 2 },
        ];
        storage.persist_chunks(&doc.path, &chunks, &embeddings).unwrap();

        let hits = storage.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "a.txt:0");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn get_chunk_returns_owning_document_path() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(dir.path()).unwrap();
        let doc = sample_document("a.txt", "hash1");
        storage.upsert_document(&doc).unwrap();

        let chunk = Chunk {
            id: "a.txt:0".into(),
            document_hash: "hash1".into(),
            ordinal: 0,
            start_offset: 0,
            end_offset: 5,
            token_estimate: 2,
            text: "hello".into(),
        };
        storage.persist_chunks(&doc.path, &[chunk], &[]).unwrap();

        let (path, found) = storage.get_chunk("a.txt:0").unwrap().unwrap();
        assert_eq!(path, doc.path);
        assert_eq!(found.text, "hello");
        assert_eq!(found.document_hash, "hash1");
        assert!(storage.get_chunk("missing").unwrap().is_none());
    }

    // §3 FileFingerprint: two documents sharing a content hash produce
    // identical chunk ids, so an already-embedded one's vectors are found
    // by hash lookup before a second document with the same content would
    // need to be re-embedded.
    #[test]
    fn find_embeddings_by_hash_locates_an_existing_documents_embeddings() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(dir.path()).unwrap();
        let doc = sample_document("a.txt", "shared-hash");
        storage.upsert_document(&doc).unwrap();

        let chunk = Chunk {
            id: "shared-hash:0".into(),
            document_hash: "shared-hash".into(),
            ordinal: 0,
            start_offset: 0,
            end_offset: 5,
            token_estimate: 2,
            text: "hello".into(),
        };
        let embedding = Embedding { chunk_id: "shared-hash:0".into(), vector: vec![0.5, 0.5], model_id: "m1".into(), dim: 2 };
        storage.persist_chunks(&doc.path, &[chunk], &[embedding]).unwrap();

        let found = storage.find_embeddings_by_hash("shared-hash").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.id, "shared-hash:0");
        assert_eq!(found[0].1.vector, vec![0.5, 0.5]);

        assert!(storage.find_embeddings_by_hash("no-such-hash").unwrap().is_empty());
    }

    #[test]
    fn corrupt_store_fails_open_rather_than_truncating() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("index.sqlite3");
        std::fs::write(&db_path, b"not a sqlite file at all").unwrap();
        let err = Storage::open_at(&db_path).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
