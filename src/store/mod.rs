//! Document storage abstraction.
//!
//! The [`VectorStore`] trait is the pipeline's only view of storage. Two
//! backends ship:
//!
//! - [`memory::InMemoryStore`]: a map of documents, persisted as
//!   `<dir>/documents.json`.
//! - [`sqlite::SqliteStore`]: SQLite with an FTS5 index, written through
//!   on every call; `persist` checkpoints the WAL.
//!
//! The pipeline treats the store as crash-consistent only after
//! [`persist`](VectorStore::persist) returns `Ok`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{Document, ScoredDocument, SearchFilter};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Abstract storage backend for analysis documents.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`add_documents`](VectorStore::add_documents) | Insert or overwrite documents by id |
/// | [`delete_by_file_path`](VectorStore::delete_by_file_path) | Remove every document of a file |
/// | [`search`](VectorStore::search) | Keyword search with metadata filter |
/// | [`persist`](VectorStore::persist) | Make all writes durable |
/// | [`load`](VectorStore::load) | Restore from the durable form |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert documents; an existing document with the same id is replaced.
    async fn add_documents(&self, docs: &[Document]) -> Result<()>;

    /// Delete all documents whose metadata `file_path` equals `file_path`.
    /// Returns how many were removed.
    async fn delete_by_file_path(&self, file_path: &str) -> Result<usize>;

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>>;

    async fn persist(&self, dir: &Path) -> Result<()>;

    async fn load(&self, dir: &Path) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// Open the backend named in `[store]`, loading any persisted documents.
pub async fn open_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    match config.store.backend.as_str() {
        "memory" => {
            let store = InMemoryStore::new();
            store.load(&config.index.state_dir).await?;
            Ok(Arc::new(store))
        }
        "sqlite" => Ok(Arc::new(SqliteStore::open(&config.sqlite_path()).await?)),
        other => anyhow::bail!("Unknown store backend: '{}'", other),
    }
}

/// Lowercased whitespace-separated terms of a keyword query.
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
