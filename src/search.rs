//! Keyword search over the persisted document store.
//!
//! Scores come from the backend: match-term fraction for the memory store,
//! negated BM25 for SQLite. Only their order is meaningful.

use anyhow::Result;

use crate::config::Config;
use crate::models::{DocumentKind, ScoredDocument, SearchFilter};
use crate::store::{open_store, VectorStore};

const DEFAULT_LIMIT: usize = 10;
const EXCERPT_CHARS: usize = 240;

/// Query `store` and order hits by score desc, then path and id asc.
pub async fn search_documents(
    store: &dyn VectorStore,
    query: &str,
    filter: &SearchFilter,
    limit: usize,
) -> Result<Vec<ScoredDocument>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut hits = store.search(query, limit, filter).await?;
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document.metadata.file_path.cmp(&b.document.metadata.file_path))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    Ok(hits)
}

pub async fn run_search(
    config: &Config,
    query: &str,
    kind: Option<String>,
    file: Option<String>,
    language: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let filter = SearchFilter {
        kind: kind.as_deref().map(str::parse::<DocumentKind>).transpose()?,
        file_path: file,
        language,
    };

    let store = open_store(config).await?;
    let results = search_documents(
        store.as_ref(),
        query,
        &filter,
        limit.unwrap_or(DEFAULT_LIMIT),
    )
    .await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in results.iter().enumerate() {
        let meta = &hit.document.metadata;
        let symbol = if meta.symbol.is_empty() {
            String::new()
        } else {
            format!(" :: {}", meta.symbol)
        };
        println!(
            "{}. [{:.2}] {} {}{}",
            i + 1,
            hit.score,
            meta.kind.as_str(),
            meta.file_path,
            symbol
        );
        if let (Some(start), Some(end)) = (meta.line_start, meta.line_end) {
            println!("    lines: {}-{}", start, end);
        }
        println!("    updated: {}", meta.last_updated.format("%Y-%m-%d"));
        println!("    excerpt: \"{}\"", excerpt(&hit.document.content));
        println!("    id: {}", hit.document.id);
        println!();
    }

    Ok(())
}

fn excerpt(content: &str) -> String {
    let flat = content.replace('\n', " ");
    let trimmed = flat.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_analysis;
    use crate::models::{AnalysisResult, QualityTier};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn analysis(path: &str, summary: &str) -> AnalysisResult {
        AnalysisResult {
            file_path: path.to_string(),
            language: "Go".to_string(),
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_search_orders_and_filters() {
        let store = InMemoryStore::new();
        for a in [
            analysis("b/cache.go", "Redis cache wrapper"),
            analysis("a/cache.go", "Redis cache wrapper"),
            analysis("c/http.go", "HTTP router"),
        ] {
            store
                .add_documents(&chunk_analysis(&a, QualityTier::Lite, Utc::now()))
                .await
                .unwrap();
        }

        let hits = search_documents(&store, "redis cache", &SearchFilter::default(), 10)
            .await
            .unwrap();
        let paths: Vec<_> = hits
            .iter()
            .map(|h| h.document.metadata.file_path.as_str())
            .collect();
        assert_eq!(paths, vec!["a/cache.go", "b/cache.go"]);

        let filter = SearchFilter {
            file_path: Some("c/http.go".to_string()),
            ..Default::default()
        };
        assert!(search_documents(&store, "redis", &filter, 10)
            .await
            .unwrap()
            .is_empty());
        assert!(search_documents(&store, "  ", &SearchFilter::default(), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let cut = excerpt(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 3);
        assert_eq!(excerpt("a\nb"), "a b");
    }
}
