//! Persisted index state.
//!
//! Two JSON files live in the state directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `state.json` | last processed revision + path → content hash |
//! | `analyses.json` | path → last [`AnalysisResult`], used for dependency expansion |
//!
//! Both are written to a temporary sibling and renamed into place, so a
//! failed save never leaves a half-written file over a previously valid one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::models::AnalysisResult;

const STATE_FILE_NAME: &str = "state.json";
const ANALYSES_FILE_NAME: &str = "analyses.json";

/// Which content was last successfully analyzed and stored, per file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexState {
    #[serde(default)]
    pub last_revision: String,
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl IndexState {
    /// True if `path` has never been indexed or its hash differs from the
    /// recorded one.
    pub fn is_changed(&self, path: &str, hash: &str) -> bool {
        match self.file_hashes.get(path) {
            Some(stored) => stored != hash,
            None => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_revision.is_empty() && self.file_hashes.is_empty()
    }
}

/// Load state from `<dir>/state.json`. A missing file yields an empty state.
pub async fn load_state(dir: &Path) -> Result<IndexState> {
    let path = dir.join(STATE_FILE_NAME);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse state file: {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IndexState::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read state file: {}", path.display())),
    }
}

/// Stamp `last_updated` and write `<dir>/state.json`.
pub async fn save_state(dir: &Path, state: &mut IndexState) -> Result<()> {
    state.last_updated = Some(Utc::now());
    let bytes = serde_json::to_vec_pretty(state)?;
    write_atomic(&dir.join(STATE_FILE_NAME), &bytes).await
}

/// Load the analyses snapshot. A missing file yields an empty map.
pub async fn load_analyses(dir: &Path) -> Result<HashMap<String, AnalysisResult>> {
    let path = dir.join(ANALYSES_FILE_NAME);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse analyses file: {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read analyses file: {}", path.display()))
        }
    }
}

pub async fn save_analyses(dir: &Path, analyses: &HashMap<String, AnalysisResult>) -> Result<()> {
    // Sorted keys keep the snapshot diff-friendly.
    let ordered: BTreeMap<&String, &AnalysisResult> = analyses.iter().collect();
    let bytes = serde_json::to_vec_pretty(&ordered)?;
    write_atomic(&dir.join(ANALYSES_FILE_NAME), &bytes).await
}

/// Write `bytes` to a temporary sibling of `path`, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}

/// Current `HEAD` commit of the repository containing `root`, if any.
pub async fn git_head_revision(root: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .arg("rev-parse")
        .arg("HEAD")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if head.is_empty() {
        None
    } else {
        Some(head)
    }
}
