//! Run orchestration.
//!
//! Coordinates one indexing pass: load state → select changed files →
//! batch-analyze → chunk → replace documents in the store → persist.
//!
//! Two modes share the same tail:
//!
//! - [`Pipeline::run`]: analyze every file whose content hash changed.
//! - [`Pipeline::run_update`]: additionally re-analyze files that depend on
//!   changed directories and remove files the walker no longer reports.
//!
//! A file's hash enters the state only after its documents were stored, so
//! a file whose storage failed is picked up again by the next run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::FileAnalyzer;
use crate::batcher::{Batcher, ProgressFn};
use crate::chunk::{build_reverse_dependency_docs, chunk_analysis, shared_dependency_paths};
use crate::config::Config;
use crate::cost::{estimate_cost, estimate_run, CostEstimate};
use crate::deps::ChangeSetExpander;
use crate::models::{AnalysisResult, FileRecord, QualityTier};
use crate::state::{
    git_head_revision, load_analyses, load_state, save_analyses, save_state, IndexState,
};
use crate::store::VectorStore;

/// Settings a pipeline needs from the configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub tier: QualityTier,
    pub concurrency: usize,
    /// Used only to price the run.
    pub model: String,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.index.root.clone(),
            state_dir: config.index.state_dir.clone(),
            tier: config.analysis.quality,
            concurrency: config.analysis.max_concurrency,
            model: config.llm.model.clone().unwrap_or_default(),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub files_processed: usize,
    /// Unchanged since the last successful run.
    pub files_skipped: usize,
    /// Selected for analysis but not stored: analysis errors, quota skips,
    /// cancellations and store failures.
    pub files_failed: usize,
    pub files_removed: usize,
    pub dependency_affected: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub duration: Duration,
    pub errors: Vec<String>,
    /// Analyses stored during this run, in completion order.
    pub analyses: Vec<AnalysisResult>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("load state: {0:#}")]
    State(anyhow::Error),

    /// Everything up to the failed step was written; `partial` says what.
    #[error("persist index: {source:#}")]
    Persist {
        partial: Box<RunResult>,
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn partial(&self) -> Option<&RunResult> {
        match self {
            PipelineError::Persist { partial, .. } => Some(partial.as_ref()),
            PipelineError::State(_) => None,
        }
    }
}

pub struct Pipeline {
    options: PipelineOptions,
    analyzer: Arc<dyn FileAnalyzer>,
    store: Arc<dyn VectorStore>,
    expander: ChangeSetExpander,
    progress: Option<ProgressFn>,
    force: bool,
}

impl Pipeline {
    pub fn new(
        options: PipelineOptions,
        analyzer: Arc<dyn FileAnalyzer>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            options,
            analyzer,
            store,
            expander: ChangeSetExpander::default(),
            progress: None,
            force: false,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Treat every file as changed, ignoring the stored hashes.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Analyze and store every file whose content changed since the last run.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        files: &[FileRecord],
    ) -> Result<RunResult, PipelineError> {
        self.execute(cancel, files, false).await
    }

    /// Like [`run`](Self::run), plus dependency expansion and removal of
    /// files that no longer exist.
    pub async fn run_update(
        &self,
        cancel: &CancellationToken,
        files: &[FileRecord],
    ) -> Result<RunResult, PipelineError> {
        self.execute(cancel, files, true).await
    }

    /// Estimate what analyzing the changed files would cost. Makes no calls.
    pub async fn dry_run(&self, files: &[FileRecord]) -> Result<CostEstimate> {
        dry_run(&self.options.state_dir, self.options.tier, files).await
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        files: &[FileRecord],
        update: bool,
    ) -> Result<RunResult, PipelineError> {
        let started = Instant::now();
        let state_dir = &self.options.state_dir;
        let mut state = load_state(state_dir).await.map_err(PipelineError::State)?;
        let mut result = RunResult::default();

        let (mut selected, unchanged): (Vec<&FileRecord>, Vec<&FileRecord>) = files
            .iter()
            .partition(|f| self.force || state.is_changed(&f.rel_path, &f.content_hash));
        result.files_skipped = unchanged.len();

        let mut snapshot = match load_analyses(state_dir).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable analyses snapshot: {:#}", e);
                HashMap::new()
            }
        };

        let shared_before = shared_dependency_paths(&snapshot);

        let removed = if update {
            let affected = self.expand(&selected, &unchanged, &snapshot);
            result.files_skipped -= affected.len();
            result.dependency_affected = affected.iter().map(|f| f.rel_path.clone()).collect();
            selected.extend(affected);
            removed_paths(&state, files)
        } else {
            Vec::new()
        };

        if selected.is_empty() && removed.is_empty() {
            debug!(skipped = result.files_skipped, "Nothing changed");
            result.duration = started.elapsed();
            return Ok(result);
        }

        for path in &removed {
            match self.store.delete_by_file_path(path).await {
                Ok(_) => {
                    state.file_hashes.remove(path);
                    snapshot.remove(path);
                    result.files_removed += 1;
                }
                Err(e) => result.errors.push(format!("remove {}: {:#}", path, e)),
            }
        }

        let to_analyze: Vec<FileRecord> = selected.into_iter().cloned().collect();
        let walker_hashes: HashMap<&str, &str> = to_analyze
            .iter()
            .map(|f| (f.rel_path.as_str(), f.content_hash.as_str()))
            .collect();

        let mut batcher = Batcher::new(self.analyzer.clone(), self.options.concurrency);
        if let Some(ref progress) = self.progress {
            batcher = batcher.with_progress(progress.clone());
        }
        let outcome = batcher.process_files(cancel, &to_analyze).await;
        result.input_tokens = outcome.input_tokens;
        result.output_tokens = outcome.output_tokens;
        result.errors.extend(outcome.errors.iter().map(|e| e.to_string()));

        let now = Utc::now();
        for analysis in outcome.results {
            let path = analysis.file_path.clone();
            if let Err(e) = self.store.delete_by_file_path(&path).await {
                result.errors.push(format!("delete old docs for {}: {:#}", path, e));
                continue;
            }
            let docs = chunk_analysis(&analysis, self.options.tier, now);
            if let Err(e) = self.store.add_documents(&docs).await {
                result.errors.push(format!("store docs for {}: {:#}", path, e));
                continue;
            }

            // The walker's hash is what the next run compares against.
            let hash = walker_hashes
                .get(path.as_str())
                .map(|h| h.to_string())
                .unwrap_or_else(|| analysis.content_hash.clone());
            if analysis.is_failed() {
                warn!(file = %path, "Stored placeholder analysis");
            }
            state.file_hashes.insert(path.clone(), hash);
            snapshot.insert(path, analysis.clone());
            result.analyses.push(analysis);
            result.files_processed += 1;
        }
        result.files_failed = to_analyze.len() - result.files_processed;
        result.estimated_cost =
            estimate_cost(&self.options.model, result.input_tokens, result.output_tokens);

        if let Err(e) = save_analyses(state_dir, &snapshot).await {
            warn!("Failed to save analyses snapshot: {:#}", e);
            result.errors.push(format!("save analyses snapshot: {:#}", e));
        }

        // Dependencies no longer shared by two files lose their document.
        let shared_after = shared_dependency_paths(&snapshot);
        for stale in shared_before.difference(&shared_after) {
            if let Err(e) = self.store.delete_by_file_path(stale).await {
                result.errors.push(format!("remove {}: {:#}", stale, e));
            }
        }

        let reverse_docs = build_reverse_dependency_docs(&snapshot, now);
        if !reverse_docs.is_empty() {
            if let Err(e) = self.store.add_documents(&reverse_docs).await {
                result.errors.push(format!("store reverse-dependency docs: {:#}", e));
            }
        }

        if let Err(e) = self.store.persist(state_dir).await {
            return Err(self.persist_failed(result, started, e));
        }

        if let Some(revision) = git_head_revision(&self.options.root).await {
            state.last_revision = revision;
        }
        if let Err(e) = save_state(state_dir, &mut state).await {
            return Err(self.persist_failed(result, started, e));
        }

        result.duration = started.elapsed();
        info!(
            processed = result.files_processed,
            skipped = result.files_skipped,
            failed = result.files_failed,
            removed = result.files_removed,
            "Run complete"
        );
        Ok(result)
    }

    /// Unchanged files pulled back in because something they depend on changed.
    fn expand<'a>(
        &self,
        changed: &[&FileRecord],
        unchanged: &[&'a FileRecord],
        snapshot: &HashMap<String, AnalysisResult>,
    ) -> Vec<&'a FileRecord> {
        let changed_paths: Vec<String> = changed.iter().map(|f| f.rel_path.clone()).collect();
        let expansion = self.expander.expand(&changed_paths, snapshot);
        if !expansion.dependency_affected.is_empty() {
            info!(
                count = expansion.dependency_affected.len(),
                "Re-analyzing dependency-affected files"
            );
        }

        // Affected paths the walker no longer reports cannot be analyzed.
        let by_path: HashMap<&str, &'a FileRecord> = unchanged
            .iter()
            .map(|f| (f.rel_path.as_str(), *f))
            .collect();
        expansion
            .dependency_affected
            .iter()
            .filter_map(|p| by_path.get(p.as_str()).copied())
            .collect()
    }

    fn persist_failed(
        &self,
        mut result: RunResult,
        started: Instant,
        source: anyhow::Error,
    ) -> PipelineError {
        result.duration = started.elapsed();
        PipelineError::Persist {
            partial: Box::new(result),
            source,
        }
    }
}

/// Cost of analyzing the files that changed against the state in `state_dir`.
pub async fn dry_run(
    state_dir: &Path,
    tier: QualityTier,
    files: &[FileRecord],
) -> Result<CostEstimate> {
    let state = load_state(state_dir).await?;
    let sizes: Vec<u64> = files
        .iter()
        .filter(|f| state.is_changed(&f.rel_path, &f.content_hash))
        .map(|f| f.size)
        .collect();
    Ok(estimate_run(&sizes, tier))
}

/// Indexed paths the walker did not report this time, sorted.
fn removed_paths(state: &IndexState, files: &[FileRecord]) -> Vec<String> {
    let current: HashSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
    state
        .file_hashes
        .keys()
        .filter(|p| !current.contains(p.as_str()))
        .cloned()
        .collect()
}
