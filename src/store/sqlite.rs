//! SQLite-backed [`VectorStore`] with an FTS5 keyword index.
//!
//! Every call writes through to the database, so [`load`](VectorStore::load)
//! has nothing to do. [`persist`](VectorStore::persist) checkpoints the WAL
//! into the main database file.
//!
//! # Schema
//!
//! - `documents`: one row per document, metadata in columns.
//! - `documents_fts`: FTS5 table over document content, keyed by `doc_id`.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{query_terms, VectorStore};
use crate::models::{Document, DocumentKind, DocumentMetadata, ScoredDocument, SearchFilter};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `db_path` and ensure the schema.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            line_start INTEGER,
            line_end INTEGER,
            content_hash TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL,
            symbol TEXT NOT NULL DEFAULT '',
            language TEXT NOT NULL DEFAULT '',
            last_updated TEXT NOT NULL,
            content TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_file_path ON documents(file_path)")
        .execute(pool)
        .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                doc_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Turn free text into an FTS5 query: each term quoted, any term may match.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query_terms(query)
        .into_iter()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let kind: String = row.get("kind");
    let last_updated: String = row.get("last_updated");
    let line_start: Option<i64> = row.get("line_start");
    let line_end: Option<i64> = row.get("line_end");

    Ok(Document {
        id: row.get("id"),
        content: row.get("content"),
        metadata: DocumentMetadata {
            file_path: row.get("file_path"),
            line_start: line_start.and_then(|n| u32::try_from(n).ok()),
            line_end: line_end.and_then(|n| u32::try_from(n).ok()),
            content_hash: row.get("content_hash"),
            kind: kind.parse::<DocumentKind>()?,
            symbol: row.get("symbol"),
            language: row.get("language"),
            last_updated: DateTime::parse_from_rfc3339(&last_updated)
                .with_context(|| format!("Invalid timestamp in store: {}", last_updated))?
                .with_timezone(&Utc),
        },
    })
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn add_documents(&self, docs: &[Document]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            let meta = &doc.metadata;
            sqlx::query(
                r#"
                INSERT INTO documents (id, file_path, line_start, line_end, content_hash,
                                       kind, symbol, language, last_updated, content)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    file_path = excluded.file_path,
                    line_start = excluded.line_start,
                    line_end = excluded.line_end,
                    content_hash = excluded.content_hash,
                    kind = excluded.kind,
                    symbol = excluded.symbol,
                    language = excluded.language,
                    last_updated = excluded.last_updated,
                    content = excluded.content
                "#,
            )
            .bind(&doc.id)
            .bind(&meta.file_path)
            .bind(meta.line_start.map(i64::from))
            .bind(meta.line_end.map(i64::from))
            .bind(&meta.content_hash)
            .bind(meta.kind.as_str())
            .bind(&meta.symbol)
            .bind(&meta.language)
            .bind(meta.last_updated.to_rfc3339())
            .bind(&doc.content)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("INSERT INTO documents_fts (doc_id, content) VALUES (?, ?)")
                .bind(&doc.id)
                .bind(&doc.content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_file_path(&self, file_path: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM documents_fts WHERE doc_id IN (SELECT id FROM documents WHERE file_path = ?)",
        )
        .bind(file_path)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM documents WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT d.id, d.file_path, d.line_start, d.line_end, d.content_hash, d.kind,
                   d.symbol, d.language, d.last_updated, d.content,
                   bm25(documents_fts) AS rank
            FROM documents_fts
            JOIN documents d ON d.id = documents_fts.doc_id
            WHERE documents_fts MATCH ?
              AND (? IS NULL OR d.kind = ?)
              AND (? IS NULL OR d.file_path = ?)
              AND (? IS NULL OR lower(d.language) = lower(?))
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.file_path.as_deref())
        .bind(filter.file_path.as_deref())
        .bind(filter.language.as_deref())
        .bind(filter.language.as_deref())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Ok(ScoredDocument {
                    document: row_to_document(row)?,
                    // bm25 is lower-is-better; negate so higher is better.
                    score: -rank,
                })
            })
            .collect()
    }

    async fn persist(&self, _dir: &Path) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to checkpoint database")?;
        Ok(())
    }

    async fn load(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
