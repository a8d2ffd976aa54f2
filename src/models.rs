//! Core data models used throughout autodoc.
//!
//! These types represent the files, analyses, and documents that flow
//! through the incremental analysis pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A source file discovered by the walker. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute path used to read the file.
    pub path: PathBuf,
    /// Path relative to the indexed root; the file's stable identifier.
    pub rel_path: String,
    pub size: u64,
    pub language: String,
    pub content_hash: String,
}

/// Controls how much detail is requested from the analysis service and
/// how many document granularities are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Lite,
    #[default]
    Normal,
    Max,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Lite => "lite",
            QualityTier::Normal => "normal",
            QualityTier::Max => "max",
        }
    }

    /// Estimated output tokens the service produces per file at this tier.
    pub fn output_tokens_per_file(&self) -> u64 {
        match self {
            QualityTier::Lite => 500,
            QualityTier::Normal => 1500,
            QualityTier::Max => 3000,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of relationship a file declares to a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Import,
    ApiCall,
    Rpc,
    Database,
    Event,
    Other(String),
}

impl DependencyKind {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyKind::Import => "import",
            DependencyKind::ApiCall => "api_call",
            DependencyKind::Rpc => "rpc",
            DependencyKind::Database => "database",
            DependencyKind::Event => "event",
            DependencyKind::Other(s) => s,
        }
    }

    /// Service-level kinds cross a process boundary; plain imports do not.
    pub fn is_service_level(&self) -> bool {
        matches!(
            self,
            DependencyKind::ApiCall
                | DependencyKind::Rpc
                | DependencyKind::Database
                | DependencyKind::Event
        )
    }
}

impl FromStr for DependencyKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Ok(match normalized.as_str() {
            "import" => DependencyKind::Import,
            "api_call" | "api" | "http" => DependencyKind::ApiCall,
            "rpc" | "grpc" => DependencyKind::Rpc,
            "database" | "db" => DependencyKind::Database,
            "event" => DependencyKind::Event,
            _ => DependencyKind::Other(normalized),
        })
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DependencyKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DependencyKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(raw.parse().unwrap_or(DependencyKind::Other(raw)))
    }
}

/// A declared dependency. This is a heuristic string association, not a
/// verified import edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", alias = "kind", default = "default_dependency_kind")]
    pub kind: DependencyKind,
}

fn default_dependency_kind() -> DependencyKind {
    DependencyKind::Import
}

impl Dependency {
    pub fn new(name: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamDoc {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub type_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDoc {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub signature: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParamDoc>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub returns: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub line_start: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub line_end: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDoc {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub type_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

/// A class, struct, interface, or other named type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassDoc {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<FunctionDoc>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDoc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub line_start: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub line_end: u32,
}

/// Structured analysis of a single source file.
///
/// Created by the analyzer and never mutated afterwards; consumers clone
/// what they need.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default, deserialize_with = "null_as_default")]
    pub file_path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub language: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub purpose: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDoc>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<ClassDoc>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub key_logic: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content_hash: String,
}

/// Summary placed on results synthesized after every parse strategy failed.
pub const ANALYSIS_FAILED_SUMMARY: &str = "Analysis failed: could not parse LLM response.";

impl AnalysisResult {
    /// Minimal result used when the service never produced a parseable answer.
    pub fn failed(file_path: &str, language: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            language: language.to_string(),
            summary: ANALYSIS_FAILED_SUMMARY.to_string(),
            ..Default::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.summary == ANALYSIS_FAILED_SUMMARY
    }
}

/// LLMs emit `null` for empty arrays and strings often enough that a
/// missing-vs-null distinction is not worth failing a parse over.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Granularity of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    File,
    Function,
    Class,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::File => "file",
            DocumentKind::Function => "function",
            DocumentKind::Class => "class",
        }
    }
}

impl FromStr for DocumentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(DocumentKind::File),
            "function" => Ok(DocumentKind::Function),
            "class" => Ok(DocumentKind::Class),
            other => anyhow::bail!("Unknown document kind: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
    #[serde(default)]
    pub content_hash: String,
    pub kind: DocumentKind,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub language: String,
    pub last_updated: DateTime<Utc>,
}

/// The atomic unit stored for search. Re-adding a document with the same
/// id replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// A search hit with its relevance score (higher is better).
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f64,
}

/// Narrows search results by metadata fields.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub kind: Option<DocumentKind>,
    pub file_path: Option<String>,
    pub language: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        if let Some(kind) = self.kind {
            if metadata.kind != kind {
                return false;
            }
        }
        if let Some(ref path) = self.file_path {
            if &metadata.file_path != path {
                return false;
            }
        }
        if let Some(ref language) = self.language {
            if !metadata.language.eq_ignore_ascii_case(language) {
                return false;
            }
        }
        true
    }
}

/// SHA-256 of the given bytes as 64 lowercase hex characters.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let h1 = content_hash(b"hello");
        let h2 = content_hash(b"hello");
        let h3 = content_hash(b"world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dependency_kind_parsing() {
        assert_eq!("grpc".parse::<DependencyKind>().unwrap(), DependencyKind::Rpc);
        assert_eq!("api-call".parse::<DependencyKind>().unwrap(), DependencyKind::ApiCall);
        assert_eq!(
            "shell".parse::<DependencyKind>().unwrap(),
            DependencyKind::Other("shell".to_string())
        );
        assert!(DependencyKind::Database.is_service_level());
        assert!(!DependencyKind::Import.is_service_level());
    }

    #[test]
    fn test_analysis_tolerates_nulls() {
        let raw = r#"{"summary": "s", "purpose": null, "functions": null,
            "dependencies": [{"name": "redis", "type": "database"}, {"name": "fmt"}]}"#;
        let parsed: AnalysisResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.summary, "s");
        assert!(parsed.purpose.is_empty());
        assert!(parsed.functions.is_empty());
        assert_eq!(parsed.dependencies[0].kind, DependencyKind::Database);
        assert_eq!(parsed.dependencies[1].kind, DependencyKind::Import);
    }

    #[test]
    fn test_search_filter() {
        let meta = DocumentMetadata {
            file_path: "a.go".to_string(),
            line_start: None,
            line_end: None,
            content_hash: String::new(),
            kind: DocumentKind::Function,
            symbol: "main".to_string(),
            language: "Go".to_string(),
            last_updated: Utc::now(),
        };
        assert!(SearchFilter::default().matches(&meta));
        let filter = SearchFilter {
            kind: Some(DocumentKind::Class),
            ..Default::default()
        };
        assert!(!filter.matches(&meta));
        let filter = SearchFilter {
            language: Some("go".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&meta));
    }
}
