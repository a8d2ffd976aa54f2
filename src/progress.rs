//! Analysis progress reporting.
//!
//! Reports per-file progress during `autodoc index` and `autodoc update` so
//! users see how much is left. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use crate::batcher::ProgressFn;

/// A file finished (successfully or not).
#[derive(Clone, Debug)]
pub struct ProgressEvent<'a> {
    pub n: usize,
    pub total: usize,
    pub file: &'a str,
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent<'_>);
}

/// Human-friendly progress on stderr: "analyzing  12 / 1,340 files  src/main.rs".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent<'_>) {
        let line = format!(
            "analyzing  {} / {} files  {}\n",
            format_number(event.n as u64),
            format_number(event.total as u64),
            event.file
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent<'_>) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": "analyzing",
            "n": event.n,
            "total": event.total,
            "file": event.file,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Option<Arc<dyn ProgressReporter>> {
        match self {
            ProgressMode::Off => None,
            ProgressMode::Human => Some(Arc::new(StderrProgress)),
            ProgressMode::Json => Some(Arc::new(JsonProgress)),
        }
    }

    /// Adapt this mode's reporter to the batcher's callback shape.
    pub fn progress_fn(&self) -> Option<ProgressFn> {
        let reporter = self.reporter()?;
        Some(Arc::new(move |n: usize, total: usize, file: &str| {
            reporter.report(&ProgressEvent { n, total, file })
        }))
    }
}
