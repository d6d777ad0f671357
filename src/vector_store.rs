/// Vector store module
///
/// `VectorStoreManager` pairs an [`Embedder`] with a [`VectorIndex`] backend:
/// - `LocalVectorIndex`: cosine similarity over chunks persisted as JSON in
///   the vector-index directory
/// - `PgVectorIndex`: PostgreSQL with the pgvector extension
///
/// The index grows with every ingestion; there is no eviction.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use crate::documents::{ChunkMetadata, DocumentChunk};
use crate::embedding::Embedder;
use crate::error::{BotError, Result};

/// A retrieved chunk and its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// A chunk together with its embedding, ready for the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: DocumentChunk,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short backend name for logs and stats
    fn backend(&self) -> &'static str;

    /// Store every record or none of them
    async fn insert(&self, records: Vec<EmbeddedChunk>) -> anyhow::Result<()>;

    /// Up to `k` records ordered by descending cosine similarity
    async fn search(&self, embedding: &[f32], k: usize) -> anyhow::Result<Vec<ScoredChunk>>;

    async fn count(&self) -> anyhow::Result<usize>;
}

/// Cosine similarity of two vectors; 0.0 when either has zero magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub struct VectorStoreManager {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    min_score: f32,
}

impl VectorStoreManager {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, min_score: f32) -> Self {
        Self {
            embedder,
            index,
            min_score,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.index.backend()
    }

    /// Embed and persist chunks
    ///
    /// All chunks are embedded before anything is written, so an embedding
    /// failure leaves the index untouched.
    pub async fn add(&self, chunks: &[DocumentChunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(BotError::Embedding(format!(
                "{} returned {} embeddings for {} chunks",
                self.embedder.model_name(),
                embeddings.len(),
                chunks.len()
            )));
        }

        let records = chunks
            .iter()
            .cloned()
            .zip(embeddings)
            .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
            .collect();

        self.index
            .insert(records)
            .await
            .map_err(|e| BotError::Embedding(format!("failed to store embeddings: {:#}", e)))?;

        log::info!("Stored {} chunks in the {} index", chunks.len(), self.backend());
        Ok(chunks.len())
    }

    /// Retrieve up to `k` chunks relevant to `text`
    ///
    /// Chunks scoring below the similarity floor are dropped, so an empty
    /// index or an unrelated query yields an empty vec rather than an error.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        log::info!("Retrieving relevant chunks for query: {}", text);
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self
            .embedder
            .embed(&[text.to_string()])
            .await
            .map_err(|e| BotError::Retrieval(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| BotError::Retrieval("no query embedding returned".to_string()))?;

        let results: Vec<ScoredChunk> = self
            .index
            .search(&embedding, k)
            .await
            .map_err(|e| BotError::Retrieval(format!("{:#}", e)))?
            .into_iter()
            .filter(|r| r.score >= self.min_score)
            .collect();

        log::info!("Retrieved {} relevant chunks", results.len());
        Ok(results)
    }

    pub async fn count(&self) -> Result<usize> {
        self.index
            .count()
            .await
            .map_err(|e| BotError::Retrieval(format!("{:#}", e)))
    }
}

/// File-persisted in-memory index
pub struct LocalVectorIndex {
    path: PathBuf,
    entries: RwLock<Vec<EmbeddedChunk>>,
}

impl LocalVectorIndex {
    const FILE_NAME: &'static str = "index.json";

    /// Open the index stored in `dir`, starting empty if there is none yet
    pub async fn open(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse vector index {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read vector index {}", path.display()))
            }
        };
        log::info!(
            "Opened local vector index at {} ({} chunks)",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn persist(&self, entries: &[EmbeddedChunk]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(entries).context("Failed to serialize vector index")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn insert(&self, records: Vec<EmbeddedChunk>) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        let previous_len = entries.len();
        entries.extend(records);
        if let Err(e) = self.persist(&entries).await {
            entries.truncate(previous_len);
            return Err(e);
        }
        Ok(())
    }

    async fn search(&self, embedding: &[f32], k: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredChunk> = entries
            .iter()
            .map(|entry| ScoredChunk {
                chunk: entry.chunk.clone(),
                score: cosine_similarity(&entry.embedding, embedding),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// PostgreSQL + pgvector index
pub struct PgVectorIndex {
    db_pool: PgPool,
    table: String,
    dimensions: usize,
}

impl PgVectorIndex {
    pub async fn connect(
        database_url: &str,
        table: &str,
        dimensions: usize,
    ) -> anyhow::Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("Invalid embeddings table name: {:?}", table);
        }

        // Check if using connection pooler (pgBouncer)
        let use_pooler = database_url.contains(":6543") || database_url.contains("pgbouncer=true");

        let mut pool_options = sqlx::postgres::PgPoolOptions::new().max_connections(10);

        if use_pooler {
            log::info!("Using connection pooler - disabling statement timeout");
            pool_options = pool_options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET statement_timeout = 0")
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            });
        }

        let db_pool = pool_options
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let index = Self {
            db_pool,
            table: table.to_string(),
            dimensions,
        };
        index.initialize().await?;
        Ok(index)
    }

    /// Create the extension, table and similarity index if missing
    async fn initialize(&self) -> anyhow::Result<()> {
        log::info!("Initializing database table {}...", self.table);

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.db_pool)
            .await
            .context("Failed to create vector extension")?;

        let create_table_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                position INTEGER NOT NULL,
                char_offset BIGINT NOT NULL,
                embedding vector({}),
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            self.table, self.dimensions
        );

        sqlx::query(&create_table_query)
            .execute(&self.db_pool)
            .await
            .context("Failed to create embeddings table")?;

        let create_index_query = format!(
            r#"
            CREATE INDEX IF NOT EXISTS {}_embedding_idx
            ON {} USING ivfflat (embedding vector_cosine_ops)
            WITH (lists = 100)
            "#,
            self.table, self.table
        );

        sqlx::query(&create_index_query)
            .execute(&self.db_pool)
            .await
            .context("Failed to create vector index")?;

        log::info!("Database table initialized successfully");
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    fn backend(&self) -> &'static str {
        "pgvector"
    }

    async fn insert(&self, records: Vec<EmbeddedChunk>) -> anyhow::Result<()> {
        let insert_query = format!(
            r#"
            INSERT INTO {} (id, content, source, position, char_offset, embedding)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.table
        );

        let mut tx = self
            .db_pool
            .begin()
            .await
            .context("Failed to start transaction")?;

        for record in records {
            sqlx::query(&insert_query)
                .bind(&record.chunk.id)
                .bind(&record.chunk.content)
                .bind(&record.chunk.metadata.source)
                .bind(record.chunk.metadata.position as i32)
                .bind(record.chunk.metadata.char_offset as i64)
                .bind(Vector::from(record.embedding))
                .execute(&mut *tx)
                .await
                .context("Failed to insert embedding")?;
        }

        tx.commit().await.context("Failed to commit embeddings")?;
        Ok(())
    }

    async fn search(&self, embedding: &[f32], k: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        let search_query = format!(
            r#"
            SELECT id, content, source, position, char_offset,
                   1 - (embedding <=> $1) AS score
            FROM {}
            ORDER BY embedding <=> $1
            LIMIT $2
            "#,
            self.table
        );

        let rows = sqlx::query(&search_query)
            .bind(Vector::from(embedding.to_vec()))
            .bind(k as i64)
            .fetch_all(&self.db_pool)
            .await
            .context("Failed to search for similar vectors")?;

        rows.into_iter()
            .map(|row| -> anyhow::Result<ScoredChunk> {
                Ok(ScoredChunk {
                    chunk: DocumentChunk {
                        id: row.try_get("id")?,
                        content: row.try_get("content")?,
                        metadata: ChunkMetadata {
                            source: row.try_get("source")?,
                            position: row.try_get::<i32, _>("position")? as usize,
                            char_offset: row.try_get::<i64, _>("char_offset")? as usize,
                        },
                    },
                    score: row.try_get::<f64, _>("score")? as f32,
                })
            })
            .collect()
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", self.table))
            .fetch_one(&self.db_pool)
            .await
            .context("Failed to count chunks")?
            .try_get("n")?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, content: &str, embedding: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: DocumentChunk {
                id: id.to_string(),
                content: content.to_string(),
                metadata: ChunkMetadata {
                    source: "catalog.txt".to_string(),
                    position: 0,
                    char_offset: 0,
                },
            },
            embedding,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_local_index_ranks_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVectorIndex::open(dir.path()).await.unwrap();
        index
            .insert(vec![
                record("a", "Alien", vec![1.0, 0.0, 0.0]),
                record("b", "Aliens", vec![0.9, 0.1, 0.0]),
                record("c", "Amélie", vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.id, "a");
        assert_eq!(results[1].chunk.id, "b");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_local_index_empty_search() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVectorIndex::open(dir.path()).await.unwrap();
        assert!(index.search(&[1.0, 0.0], 5).await.unwrap().is_empty());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_index_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = LocalVectorIndex::open(dir.path()).await.unwrap();
            index
                .insert(vec![record("a", "Heat", vec![0.0, 1.0])])
                .await
                .unwrap();
            index
                .insert(vec![record("a2", "Heat", vec![0.0, 1.0])])
                .await
                .unwrap();
        }
        let reopened = LocalVectorIndex::open(dir.path()).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        let results = reopened.search(&[0.0, 1.0], 1).await.unwrap();
        assert_eq!(results[0].chunk.content, "Heat");
    }

    #[tokio::test]
    async fn test_local_index_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.json"), b"{not json").unwrap();
        assert!(LocalVectorIndex::open(dir.path()).await.is_err());
    }
}
