//! Per-session semantic index over SQLite.
//!
//! Each (session, source kind) pair owns one database at
//! `{storage.index_dir}/{session_id}_{file|url}/index.db`, holding the
//! chunks and their embedding vectors. Indexes for different sessions
//! never share a database, so cross-session isolation falls out of the
//! storage layout.
//!
//! Builds are all-or-nothing: every chunk embedding is computed before a
//! single row is written, and the write replaces any prior content at the
//! same location inside one transaction. A failed build leaves whatever
//! index existed before untouched.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, vec_to_blob, Embedder};
use crate::error::QaError;
use crate::models::{RetrievedChunk, SourceKind};

/// What a completed build reports back to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildSummary {
    pub chunks: usize,
    pub dims: usize,
    pub storage_path: PathBuf,
}

/// Handle to one session's index database.
pub struct SessionIndex {
    pool: SqlitePool,
    path: PathBuf,
}

/// Compute the index database location for a (session, source kind) pair.
pub fn storage_path(index_dir: &Path, session_id: &str, kind: SourceKind) -> PathBuf {
    index_dir
        .join(format!("{}_{}", session_id, kind.as_str()))
        .join("index.db")
}

async fn connect(path: &Path, create: bool) -> Result<SqlitePool, QaError> {
    if create {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QaError::StorageFailed(format!("create {}: {}", parent.display(), e)))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| QaError::StorageFailed(format!("open {}: {}", path.display(), e)))
}

async fn ensure_schema(pool: &SqlitePool) -> Result<(), QaError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id          TEXT PRIMARY KEY,
            chunk_index INTEGER NOT NULL,
            text        TEXT NOT NULL,
            hash        TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| QaError::StorageFailed(format!("schema: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id  TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| QaError::StorageFailed(format!("schema: {}", e)))?;
    Ok(())
}

impl SessionIndex {
    /// Build (or rebuild) the index for a session from extracted text.
    ///
    /// Chunks the text, embeds every chunk up front, then replaces the
    /// stored content in one transaction. Rebuilding for the same
    /// (session, source kind) reclaims the previous index; the last
    /// completed build wins.
    pub async fn build(
        config: &Config,
        embedder: &dyn Embedder,
        session_id: &str,
        kind: SourceKind,
        text: &str,
    ) -> Result<(Self, BuildSummary), QaError> {
        let chunks = chunk_text(text, config.chunking.max_tokens);
        if chunks.is_empty() {
            return Err(QaError::ExtractionFailed(
                "no indexable text after chunking".to_string(),
            ));
        }

        // Embed everything before touching storage.
        let batch_size = config.embedding.batch_size.max(1);
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        for batch in texts.chunks(batch_size) {
            let embedded = embedder
                .embed(batch)
                .await
                .map_err(|e| QaError::EmbeddingFailed(e.to_string()))?;
            if embedded.len() != batch.len() {
                return Err(QaError::EmbeddingFailed(format!(
                    "provider returned {} vectors for {} texts",
                    embedded.len(),
                    batch.len()
                )));
            }
            vectors.extend(embedded);
        }
        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);

        let path = storage_path(&config.storage.index_dir, session_id, kind);
        let pool = connect(&path, true).await?;
        ensure_schema(&pool).await?;

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| QaError::StorageFailed(e.to_string()))?;

        sqlx::query("DELETE FROM chunk_vectors")
            .execute(&mut *tx)
            .await
            .map_err(|e| QaError::StorageFailed(e.to_string()))?;
        sqlx::query("DELETE FROM chunks")
            .execute(&mut *tx)
            .await
            .map_err(|e| QaError::StorageFailed(e.to_string()))?;

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query("INSERT INTO chunks (id, chunk_index, text, hash) VALUES (?, ?, ?, ?)")
                .bind(&chunk.id)
                .bind(chunk.chunk_index)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .execute(&mut *tx)
                .await
                .map_err(|e| QaError::StorageFailed(e.to_string()))?;

            sqlx::query("INSERT INTO chunk_vectors (chunk_id, embedding) VALUES (?, ?)")
                .bind(&chunk.id)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await
                .map_err(|e| QaError::StorageFailed(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| QaError::StorageFailed(e.to_string()))?;

        let summary = BuildSummary {
            chunks: chunks.len(),
            dims,
            storage_path: path.clone(),
        };

        Ok((Self { pool, path }, summary))
    }

    /// Reopen a previously built index without rebuilding.
    ///
    /// Returns `Ok(None)` when no index has ever been built at this
    /// session's storage location.
    pub async fn open(
        config: &Config,
        session_id: &str,
        kind: SourceKind,
    ) -> Result<Option<Self>, QaError> {
        let path = storage_path(&config.storage.index_dir, session_id, kind);
        if !path.exists() {
            return Ok(None);
        }
        let pool = connect(&path, false).await?;
        ensure_schema(&pool).await?;
        Ok(Some(Self { pool, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of chunks currently stored.
    pub async fn chunk_count(&self) -> Result<i64, QaError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QaError::StorageFailed(e.to_string()))?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Retrieve the `k` chunks most similar to `question`, best first.
    ///
    /// Embeds the question, scores every stored vector with cosine
    /// similarity, sorts descending, and truncates to `k`.
    pub async fn query(
        &self,
        embedder: &dyn Embedder,
        question: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, QaError> {
        let query_vec = embed_query(embedder, question)
            .await
            .map_err(|e| QaError::EmbeddingFailed(e.to_string()))?;

        let rows = sqlx::query(
            "SELECT c.text, c.chunk_index, v.embedding
             FROM chunks c JOIN chunk_vectors v ON v.chunk_id = c.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QaError::StorageFailed(e.to_string()))?;

        let mut scored: Vec<RetrievedChunk> = rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                RetrievedChunk {
                    text: row.get("text"),
                    score: cosine_similarity(&query_vec, &blob_to_vec(&blob)),
                    chunk_index: row.get("chunk_index"),
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatDbConfig, ServerConfig, StorageConfig};
    use anyhow::Result;
    use async_trait::async_trait;

    /// Deterministic embedder: a crude bag-of-characters direction, good
    /// enough to make "more shared words" mean "higher cosine".
    struct CharBagEmbedder;

    #[async_trait]
    impl Embedder for CharBagEmbedder {
        fn model_name(&self) -> &str {
            "char-bag-test"
        }
        fn dims(&self) -> usize {
            26
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 26];
                    for c in t.to_lowercase().chars() {
                        if c.is_ascii_lowercase() {
                            v[(c as u8 - b'a') as usize] += 1.0;
                        }
                    }
                    v
                })
                .collect())
        }
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            chat_db: ChatDbConfig {
                path: dir.join("chat.sqlite"),
            },
            storage: StorageConfig {
                index_dir: dir.join("indexes"),
            },
            chunking: Default::default(),
            retrieval: Default::default(),
            embedding: Default::default(),
            llm: Default::default(),
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
            },
        }
    }

    #[test]
    fn storage_paths_never_collide() {
        let dir = Path::new("/data");
        let a = storage_path(dir, "s1", SourceKind::File);
        let b = storage_path(dir, "s1", SourceKind::Url);
        let c = storage_path(dir, "s2", SourceKind::File);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with("s1_file/index.db"));
        assert!(b.ends_with("s1_url/index.db"));
    }

    #[tokio::test]
    async fn build_then_query_ranks_relevant_chunk_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let text = "zebras graze quietly.\n\nthe sky is blue today.\n\nfrogs jump in ponds.";

        let (index, summary) =
            SessionIndex::build(&cfg, &CharBagEmbedder, "s1", SourceKind::File, text)
                .await
                .unwrap();
        assert_eq!(summary.dims, 26);
        assert!(summary.chunks >= 1);

        let results = index
            .query(&CharBagEmbedder, "what color is the sky", 3)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results[0].text.contains("sky is blue"));
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn rebuild_replaces_previous_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());

        let (first, _) =
            SessionIndex::build(&cfg, &CharBagEmbedder, "s1", SourceKind::File, "old content")
                .await
                .unwrap();
        assert_eq!(first.chunk_count().await.unwrap(), 1);
        drop(first);

        let (second, summary) = SessionIndex::build(
            &cfg,
            &CharBagEmbedder,
            "s1",
            SourceKind::File,
            "alpha\n\nbeta\n\ngamma",
        )
        .await
        .unwrap();
        assert_eq!(second.chunk_count().await.unwrap(), summary.chunks as i64);

        let results = second.query(&CharBagEmbedder, "old content", 10).await.unwrap();
        assert!(results.iter().all(|r| r.text != "old content"));
    }

    #[tokio::test]
    async fn open_missing_index_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let opened = SessionIndex::open(&cfg, "never-built", SourceKind::Url)
            .await
            .unwrap();
        assert!(opened.is_none());
    }

    #[tokio::test]
    async fn open_reuses_persisted_index() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());

        let (built, _) =
            SessionIndex::build(&cfg, &CharBagEmbedder, "s1", SourceKind::Url, "the sky is blue")
                .await
                .unwrap();
        drop(built);

        let reopened = SessionIndex::open(&cfg, "s1", SourceKind::Url)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reopened.chunk_count().await.unwrap(), 1);
    }
}
