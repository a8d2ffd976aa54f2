//! Bounded-concurrency batch analysis with a quota circuit breaker.
//!
//! [`Batcher::process_files`] runs a [`FileAnalyzer`] over many files with
//! at most `concurrency` analyses in flight. Every submitted file ends up
//! in exactly one bucket of the returned [`BatchOutcome`]:
//!
//! | Outcome | Cause |
//! |---------|-------|
//! | succeeded | analyzer returned a result (possibly a synthesized failure summary) |
//! | `QuotaSkipped` | the breaker had tripped before the file started |
//! | `Cancelled` | the run was cancelled before or during the file |
//! | `Read` | the file could not be read from disk |
//! | `Analysis` | the analyzer returned an error |
//!
//! The breaker trips on the first quota-exhaustion error. Tripping cancels
//! the run token so in-flight calls stop at their next wait, and every file
//! not yet started is skipped without a service call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analyzer::{AnalyzeOutput, FileAnalyzer};
use crate::models::{AnalysisResult, FileRecord};

/// Called once per file with `(completed, total, rel_path)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchErrorKind {
    QuotaSkipped,
    Cancelled,
    Read,
    Analysis,
}

impl BatchErrorKind {
    /// Skips were never attempted to completion; failures were.
    pub fn is_skip(&self) -> bool {
        matches!(self, BatchErrorKind::QuotaSkipped | BatchErrorKind::Cancelled)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{file_path}: {message}")]
pub struct BatchError {
    pub file_path: String,
    pub kind: BatchErrorKind,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<AnalysisResult>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: Vec<BatchError>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.results.len()
    }

    pub fn skipped(&self) -> usize {
        self.errors.iter().filter(|e| e.kind.is_skip()).count()
    }

    pub fn failed(&self) -> usize {
        self.errors.iter().filter(|e| !e.kind.is_skip()).count()
    }
}

/// State shared between the submit loop and worker tasks.
struct Shared {
    outcome: Mutex<BatchOutcome>,
    completed: AtomicUsize,
    tripped: AtomicBool,
    total: usize,
    progress: Option<ProgressFn>,
}

impl Shared {
    fn succeed(&self, file_path: &str, output: AnalyzeOutput) {
        {
            let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
            outcome.input_tokens += output.input_tokens;
            outcome.output_tokens += output.output_tokens;
            outcome.results.push(output.result);
        }
        self.tick(file_path);
    }

    fn fail(&self, file_path: &str, kind: BatchErrorKind, message: impl Into<String>) {
        {
            let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
            outcome.errors.push(BatchError {
                file_path: file_path.to_string(),
                kind,
                message: message.into(),
            });
        }
        self.tick(file_path);
    }

    fn skip(&self, file_path: &str) {
        if self.tripped.load(Ordering::SeqCst) {
            self.fail(file_path, BatchErrorKind::QuotaSkipped, "skipped (API quota exhausted)");
        } else {
            self.fail(file_path, BatchErrorKind::Cancelled, "cancelled");
        }
    }

    fn tick(&self, file_path: &str) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(ref progress) = self.progress {
            progress(done, self.total, file_path);
        }
    }
}

pub struct Batcher {
    analyzer: Arc<dyn FileAnalyzer>,
    concurrency: usize,
    progress: Option<ProgressFn>,
}

impl Batcher {
    pub fn new(analyzer: Arc<dyn FileAnalyzer>, concurrency: usize) -> Self {
        Self {
            analyzer,
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Analyze `files`, returning once every spawned worker has finished.
    pub async fn process_files(
        &self,
        cancel: &CancellationToken,
        files: &[FileRecord],
    ) -> BatchOutcome {
        if files.is_empty() {
            return BatchOutcome::default();
        }

        let run = cancel.child_token();
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let shared = Arc::new(Shared {
            outcome: Mutex::new(BatchOutcome::default()),
            completed: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
            total: files.len(),
            progress: self.progress.clone(),
        });
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();

        for file in files {
            if shared.tripped.load(Ordering::SeqCst) {
                shared.skip(&file.rel_path);
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = run.cancelled() => {
                    shared.skip(&file.rel_path);
                    continue;
                }
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        shared.skip(&file.rel_path);
                        continue;
                    }
                },
            };

            // A worker may have tripped the breaker while we waited.
            if shared.tripped.load(Ordering::SeqCst) || run.is_cancelled() {
                drop(permit);
                shared.skip(&file.rel_path);
                continue;
            }

            let analyzer = self.analyzer.clone();
            let shared = shared.clone();
            let run = run.clone();
            let file = file.clone();
            let rel_path = file.rel_path.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;

                let content = match tokio::fs::read(&file.path).await {
                    Ok(content) => content,
                    Err(e) => {
                        shared.fail(
                            &file.rel_path,
                            BatchErrorKind::Read,
                            format!("read {}: {}", file.rel_path, e),
                        );
                        return;
                    }
                };

                match analyzer
                    .analyze(&run, &file.rel_path, &content, &file.language)
                    .await
                {
                    Ok(output) => shared.succeed(&file.rel_path, output),
                    Err(e) => {
                        if e.is_quota_exhausted() {
                            if !shared.tripped.swap(true, Ordering::SeqCst) {
                                warn!(file = %file.rel_path, "API quota exhausted, skipping remaining files");
                            }
                            run.cancel();
                        }
                        let kind = if e.is_cancelled() {
                            BatchErrorKind::Cancelled
                        } else {
                            BatchErrorKind::Analysis
                        };
                        shared.fail(&file.rel_path, kind, format!("analyze {}: {}", file.rel_path, e));
                    }
                }
            });
            in_flight.insert(handle.id(), rel_path);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, ())) => {
                    in_flight.remove(&id);
                }
                Err(e) => {
                    let path = in_flight.remove(&e.id()).unwrap_or_default();
                    warn!(file = %path, "Analysis task failed: {}", e);
                    shared.fail(&path, BatchErrorKind::Analysis, format!("analysis task failed: {}", e));
                }
            }
        }

        let outcome = std::mem::take(&mut *shared.outcome.lock().unwrap_or_else(PoisonError::into_inner));
        debug!(
            succeeded = outcome.succeeded(),
            skipped = outcome.skipped(),
            failed = outcome.failed(),
            "Batch finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzeError;
    use crate::llm::ProviderError;
    use crate::models::content_hash;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Succeeds on every call except those listed in `quota_on` (1-based).
    struct CountingAnalyzer {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        quota_on: Vec<usize>,
        delay: Duration,
    }

    impl CountingAnalyzer {
        fn new(quota_on: Vec<usize>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                quota_on,
                delay,
            })
        }
    }

    #[async_trait]
    impl FileAnalyzer for CountingAnalyzer {
        async fn analyze(
            &self,
            _cancel: &CancellationToken,
            file_path: &str,
            content: &[u8],
            language: &str,
        ) -> Result<AnalyzeOutput, AnalyzeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.quota_on.contains(&call) {
                return Err(AnalyzeError::Provider(ProviderError::QuotaExhausted(
                    "RESOURCE_EXHAUSTED".into(),
                )));
            }
            Ok(AnalyzeOutput {
                result: AnalysisResult {
                    file_path: file_path.to_string(),
                    language: language.to_string(),
                    summary: "ok".to_string(),
                    content_hash: content_hash(content),
                    ..Default::default()
                },
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    fn write_files(dir: &Path, count: usize) -> Vec<FileRecord> {
        (0..count)
            .map(|i| {
                let rel = format!("f{}.go", i);
                let path = dir.join(&rel);
                std::fs::write(&path, format!("package f{}", i)).unwrap();
                FileRecord {
                    path,
                    rel_path: rel,
                    size: 10,
                    language: "Go".to_string(),
                    content_hash: String::new(),
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_files_succeed_with_progress() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), 4);
        let analyzer = CountingAnalyzer::new(vec![], Duration::from_millis(1));
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let ticks_clone = ticks.clone();

        let batcher = Batcher::new(analyzer.clone(), 2).with_progress(Arc::new(
            move |done: usize, total: usize, _path: &str| {
                ticks_clone.lock().unwrap().push((done, total));
            },
        ));
        let outcome = batcher.process_files(&CancellationToken::new(), &files).await;

        assert_eq!(outcome.succeeded(), 4);
        assert_eq!(outcome.skipped(), 0);
        assert_eq!(outcome.failed(), 0);
        assert_eq!(outcome.input_tokens, 40);
        assert_eq!(outcome.output_tokens, 20);

        let mut ticks = ticks.lock().unwrap().clone();
        ticks.sort();
        assert_eq!(ticks, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    }

    #[tokio::test]
    async fn test_circuit_breaker_skips_remaining() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), 5);
        let analyzer = CountingAnalyzer::new(vec![2], Duration::from_millis(1));

        let outcome = Batcher::new(analyzer.clone(), 1)
            .process_files(&CancellationToken::new(), &files)
            .await;

        assert!(analyzer.calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(outcome.succeeded(), 1);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.skipped(), 3);
        let quota_skips = outcome
            .errors
            .iter()
            .filter(|e| e.kind == BatchErrorKind::QuotaSkipped)
            .count();
        assert_eq!(quota_skips, 3);
        assert_eq!(
            outcome.succeeded() + outcome.skipped() + outcome.failed(),
            files.len()
        );
    }

    /// `f0.go` hits the quota after a short delay; every other file waits
    /// until cancelled.
    struct TrippingAnalyzer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FileAnalyzer for TrippingAnalyzer {
        async fn analyze(
            &self,
            cancel: &CancellationToken,
            file_path: &str,
            _content: &[u8],
            _language: &str,
        ) -> Result<AnalyzeOutput, AnalyzeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if file_path == "f0.go" {
                tokio::time::sleep(Duration::from_millis(20)).await;
                return Err(AnalyzeError::Provider(ProviderError::QuotaExhausted(
                    "RESOURCE_EXHAUSTED".into(),
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => Err(AnalyzeError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("{} was not cancelled", file_path),
            }
        }
    }

    #[tokio::test]
    async fn test_breaker_cancels_in_flight_files() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), 6);
        let analyzer = Arc::new(TrippingAnalyzer {
            calls: AtomicUsize::new(0),
        });

        let outcome = Batcher::new(analyzer.clone(), 3)
            .process_files(&CancellationToken::new(), &files)
            .await;

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.succeeded(), 0);
        let kind_of = |path: &str| {
            outcome
                .errors
                .iter()
                .find(|e| e.file_path == path)
                .map(|e| e.kind)
        };
        assert_eq!(kind_of("f0.go"), Some(BatchErrorKind::Analysis));
        assert_eq!(kind_of("f1.go"), Some(BatchErrorKind::Cancelled));
        assert_eq!(kind_of("f2.go"), Some(BatchErrorKind::Cancelled));
        for path in ["f3.go", "f4.go", "f5.go"] {
            assert_eq!(kind_of(path), Some(BatchErrorKind::QuotaSkipped));
        }
        assert_eq!(outcome.errors.len(), files.len());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), 8);
        let analyzer = CountingAnalyzer::new(vec![], Duration::from_millis(20));

        let outcome = Batcher::new(analyzer.clone(), 2)
            .process_files(&CancellationToken::new(), &files)
            .await;

        assert_eq!(outcome.succeeded(), 8);
        assert!(analyzer.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_makes_no_calls() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), 3);
        let analyzer = CountingAnalyzer::new(vec![], Duration::from_millis(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = Batcher::new(analyzer.clone(), 2)
            .process_files(&cancel, &files)
            .await;

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.skipped(), 3);
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.kind == BatchErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_unreadable_file_is_read_error() {
        let tmp = TempDir::new().unwrap();
        let mut files = write_files(tmp.path(), 2);
        files.push(FileRecord {
            path: tmp.path().join("missing.go"),
            rel_path: "missing.go".to_string(),
            size: 0,
            language: "Go".to_string(),
            content_hash: String::new(),
        });
        let analyzer = CountingAnalyzer::new(vec![], Duration::from_millis(1));

        let outcome = Batcher::new(analyzer.clone(), 2)
            .process_files(&CancellationToken::new(), &files)
            .await;

        assert_eq!(outcome.succeeded(), 2);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.errors[0].kind, BatchErrorKind::Read);
        assert_eq!(outcome.errors[0].file_path, "missing.go");
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let analyzer = CountingAnalyzer::new(vec![], Duration::from_millis(1));
        let outcome = Batcher::new(analyzer, 4)
            .process_files(&CancellationToken::new(), &[])
            .await;
        assert_eq!(outcome.succeeded(), 0);
        assert!(outcome.errors.is_empty());
    }
}
