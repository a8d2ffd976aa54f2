//! Analysis-to-document chunker.
//!
//! Converts an [`AnalysisResult`] into the [`Document`]s stored for search:
//!
//! | Document | Key | Emitted when |
//! |----------|-----|--------------|
//! | file summary | `file:<path>` | always |
//! | blast radius | `deps:<path>` | the file has a service-level dependency |
//! | function | `func:<path>:<name>` | tier above `lite` |
//! | class/type | `class:<path>:<name>` | tier above `lite` |
//! | reverse dependency | `reverse-dep:<name>` | a dependency is shared by 2+ files |
//!
//! Each document id is a UUIDv5 of its key, so re-chunking the same file
//! yields the same ids and the store overwrites instead of duplicating.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::models::{
    AnalysisResult, ClassDoc, Document, DocumentKind, DocumentMetadata, FunctionDoc, QualityTier,
};

/// Symbol recorded on a file's blast-radius document.
pub const DEPENDENCIES_SYMBOL: &str = "dependencies";
/// Symbol recorded on cross-file reverse-dependency documents.
pub const REVERSE_DEPENDENCY_SYMBOL: &str = "reverse-dependency";

/// Deterministic document id for a key such as `file:src/main.rs`.
pub fn document_id(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

fn line(n: u32) -> Option<u32> {
    (n > 0).then_some(n)
}

/// Split one analysis into documents. Pure: the same inputs always give
/// the same output, including `now` as the recorded timestamp.
pub fn chunk_analysis(
    analysis: &AnalysisResult,
    tier: QualityTier,
    now: DateTime<Utc>,
) -> Vec<Document> {
    let path = &analysis.file_path;
    let meta = |kind: DocumentKind, symbol: &str, line_start: u32, line_end: u32| {
        DocumentMetadata {
            file_path: path.clone(),
            line_start: line(line_start),
            line_end: line(line_end),
            content_hash: analysis.content_hash.clone(),
            kind,
            symbol: symbol.to_string(),
            language: analysis.language.clone(),
            last_updated: now,
        }
    };

    let mut docs = vec![Document {
        id: document_id(&format!("file:{}", path)),
        content: file_content(analysis),
        metadata: meta(DocumentKind::File, "", 0, 0),
    }];

    let service_deps: Vec<_> = analysis
        .dependencies
        .iter()
        .filter(|d| d.kind.is_service_level())
        .collect();
    if !service_deps.is_empty() {
        let mut parts = vec![
            format!("File: {}", path),
            format!("Language: {}", analysis.language),
            "Service dependencies and blast radius:".to_string(),
        ];
        for dep in service_deps {
            parts.push(format!(
                "- Depends on {} ({}). Changes to {} may affect {}.",
                dep.name, dep.kind, dep.name, path
            ));
        }
        docs.push(Document {
            id: document_id(&format!("deps:{}", path)),
            content: parts.join("\n"),
            metadata: meta(DocumentKind::File, DEPENDENCIES_SYMBOL, 0, 0),
        });
    }

    if tier == QualityTier::Lite {
        return docs;
    }

    for func in &analysis.functions {
        docs.push(Document {
            id: document_id(&format!("func:{}:{}", path, func.name)),
            content: function_content(path, func),
            metadata: meta(DocumentKind::Function, &func.name, func.line_start, func.line_end),
        });
    }
    for class in &analysis.classes {
        docs.push(Document {
            id: document_id(&format!("class:{}:{}", path, class.name)),
            content: class_content(path, class),
            metadata: meta(DocumentKind::Class, &class.name, class.line_start, class.line_end),
        });
    }

    docs
}

fn file_content(analysis: &AnalysisResult) -> String {
    let mut parts = vec![
        format!("File: {}", analysis.file_path),
        format!("Language: {}", analysis.language),
        format!("Summary: {}", analysis.summary),
    ];
    if !analysis.purpose.is_empty() {
        parts.push(format!("Purpose: {}", analysis.purpose));
    }
    if !analysis.dependencies.is_empty() {
        let deps: Vec<String> = analysis
            .dependencies
            .iter()
            .map(|d| format!("{} ({})", d.name, d.kind))
            .collect();
        parts.push(format!("Dependencies: {}", deps.join(", ")));
    }
    if !analysis.key_logic.is_empty() {
        parts.push(format!("Key Logic: {}", analysis.key_logic.join("; ")));
    }
    parts.join("\n")
}

fn function_content(path: &str, func: &FunctionDoc) -> String {
    let mut parts = vec![format!("Function: {}", func.name)];
    if !func.signature.is_empty() {
        parts.push(format!("Signature: {}", func.signature));
    }
    parts.push(format!("Summary: {}", func.summary));
    if !func.parameters.is_empty() {
        let params: Vec<String> = func
            .parameters
            .iter()
            .map(|p| format!("{} ({}): {}", p.name, p.type_name, p.description))
            .collect();
        parts.push(format!("Parameters: {}", params.join("; ")));
    }
    if !func.returns.is_empty() {
        parts.push(format!("Returns: {}", func.returns));
    }
    parts.push(format!("File: {}", path));
    parts.join("\n")
}

fn class_content(path: &str, class: &ClassDoc) -> String {
    let mut parts = vec![
        format!("Class/Type: {}", class.name),
        format!("Summary: {}", class.summary),
    ];
    if !class.fields.is_empty() {
        let fields: Vec<String> = class
            .fields
            .iter()
            .map(|f| format!("{} ({}): {}", f.name, f.type_name, f.description))
            .collect();
        parts.push(format!("Fields: {}", fields.join("; ")));
    }
    if !class.methods.is_empty() {
        let methods: Vec<String> = class
            .methods
            .iter()
            .map(|m| format!("{}: {}", m.name, m.summary))
            .collect();
        parts.push(format!("Methods: {}", methods.join("; ")));
    }
    parts.push(format!("File: {}", path));
    parts.join("\n")
}

/// Store path of the reverse-dependency document for `name`. The prefix keeps
/// it apart from real file paths so it can be deleted on its own.
pub fn reverse_dependency_path(name: &str) -> String {
    format!("reverse-dep:{}", name.replace('/', "-").to_lowercase())
}

fn dependents_by_name(
    analyses: &HashMap<String, AnalysisResult>,
) -> BTreeMap<&str, BTreeSet<&str>> {
    let mut reverse: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for analysis in analyses.values() {
        for dep in &analysis.dependencies {
            if dep.name.is_empty() {
                continue;
            }
            reverse
                .entry(dep.name.as_str())
                .or_default()
                .insert(analysis.file_path.as_str());
        }
    }
    reverse.retain(|_, dependents| dependents.len() >= 2);
    reverse
}

/// Reverse-dependency store paths that `analyses` would produce documents for.
pub fn shared_dependency_paths(analyses: &HashMap<String, AnalysisResult>) -> BTreeSet<String> {
    dependents_by_name(analyses)
        .into_keys()
        .map(reverse_dependency_path)
        .collect()
}

/// One document per dependency name referenced by two or more files.
///
/// Output is ordered by dependency name and each file list is sorted, so the
/// result does not depend on map iteration order.
pub fn build_reverse_dependency_docs(
    analyses: &HashMap<String, AnalysisResult>,
    now: DateTime<Utc>,
) -> Vec<Document> {
    dependents_by_name(analyses)
        .into_iter()
        .map(|(name, dependents)| {
            let mut parts = vec![
                format!("Dependency: {}", name),
                format!("Used by {} files (blast radius):", dependents.len()),
            ];
            for file in &dependents {
                parts.push(format!("- {} depends on {}", file, name));
            }
            parts.push(format!(
                "\nChanges to {} could affect all {} files listed above.",
                name,
                dependents.len()
            ));

            let path = reverse_dependency_path(name);
            Document {
                id: document_id(&path),
                content: parts.join("\n"),
                metadata: DocumentMetadata {
                    file_path: path,
                    line_start: None,
                    line_end: None,
                    content_hash: String::new(),
                    kind: DocumentKind::File,
                    symbol: REVERSE_DEPENDENCY_SYMBOL.to_string(),
                    language: String::new(),
                    last_updated: now,
                },
            }
        })
        .collect()
}
