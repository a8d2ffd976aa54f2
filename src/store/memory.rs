//! In-memory [`VectorStore`] persisted as a single JSON file.
//!
//! Documents live in a `HashMap` behind `std::sync::RwLock`. Keyword
//! search scores a document by how many query terms its content contains.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{query_terms, VectorStore};
use crate::models::{Document, ScoredDocument, SearchFilter};
use crate::state::write_atomic;

const DOCUMENTS_FILE_NAME: &str = "documents.json";

pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Document>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of all documents, ordered by id.
    pub fn documents(&self) -> Vec<Document> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Document> = docs.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn add_documents(&self, docs: &[Document]) -> Result<()> {
        let mut stored = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        for doc in docs {
            stored.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete_by_file_path(&self, file_path: &str) -> Result<usize> {
        let mut stored = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let before = stored.len();
        stored.retain(|_, d| d.metadata.file_path != file_path);
        Ok(before - stored.len())
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>> {
        let terms = query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let stored = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<ScoredDocument> = stored
            .values()
            .filter(|d| filter.matches(&d.metadata))
            .filter_map(|d| {
                let text = d.content.to_lowercase();
                let matches = terms.iter().filter(|t| text.contains(t.as_str())).count();
                (matches > 0).then(|| ScoredDocument {
                    document: d.clone(),
                    score: matches as f64 / terms.len() as f64,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn persist(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.documents())?;
        write_atomic(&dir.join(DOCUMENTS_FILE_NAME), &bytes).await
    }

    async fn load(&self, dir: &Path) -> Result<()> {
        let path = dir.join(DOCUMENTS_FILE_NAME);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let docs: Vec<Document> = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let mut stored = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        stored.clear();
        stored.extend(docs.into_iter().map(|d| (d.id.clone(), d)));
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.docs.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentKind, DocumentMetadata};
    use chrono::Utc;
    use tempfile::TempDir;

    fn doc(id: &str, path: &str, kind: DocumentKind, content: &str) -> Document {
        Document {
            id: id.to_string(),
            content: content.to_string(),
            metadata: DocumentMetadata {
                file_path: path.to_string(),
                line_start: None,
                line_end: None,
                content_hash: "h".to_string(),
                kind,
                symbol: String::new(),
                language: "Go".to_string(),
                last_updated: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_add_overwrites_by_id() {
        let store = InMemoryStore::new();
        store
            .add_documents(&[doc("1", "a.go", DocumentKind::File, "old")])
            .await
            .unwrap();
        store
            .add_documents(&[doc("1", "a.go", DocumentKind::File, "new")])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.documents()[0].content, "new");
    }

    #[tokio::test]
    async fn test_delete_by_file_path() {
        let store = InMemoryStore::new();
        store
            .add_documents(&[
                doc("1", "a.go", DocumentKind::File, "x"),
                doc("2", "a.go", DocumentKind::Function, "y"),
                doc("3", "b.go", DocumentKind::File, "z"),
            ])
            .await
            .unwrap();
        assert_eq!(store.delete_by_file_path("a.go").await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.delete_by_file_path("missing.go").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_search_ranks_and_filters() {
        let store = InMemoryStore::new();
        store
            .add_documents(&[
                doc("1", "a.go", DocumentKind::File, "Redis cache client"),
                doc("2", "b.go", DocumentKind::Function, "cache eviction"),
                doc("3", "c.go", DocumentKind::File, "HTTP router"),
            ])
            .await
            .unwrap();

        let hits = store
            .search("redis cache", 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.id, "1");
        assert!(hits[0].score > hits[1].score);

        let filter = SearchFilter {
            kind: Some(DocumentKind::Function),
            ..Default::default()
        };
        let hits = store.search("cache", 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "2");

        assert!(store.search("   ", 10, &SearchFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = InMemoryStore::new();
        store
            .add_documents(&[doc("1", "a.go", DocumentKind::File, "x")])
            .await
            .unwrap();
        store.persist(tmp.path()).await.unwrap();
        assert!(tmp.path().join("documents.json").exists());

        let reloaded = InMemoryStore::new();
        reloaded.load(tmp.path()).await.unwrap();
        assert_eq!(reloaded.documents(), store.documents());

        let empty = InMemoryStore::new();
        empty.load(&tmp.path().join("nowhere")).await.unwrap();
        assert_eq!(empty.count().await.unwrap(), 0);
    }
}
