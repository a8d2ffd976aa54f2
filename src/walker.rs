//! Filesystem walker producing [`FileRecord`]s.
//!
//! Walks `root`, pruning well-known build and dependency directories, and
//! keeps regular text files that pass the include/exclude globs and the
//! size limit. Globs are matched against both the relative path and the
//! bare file name, so `*.go` matches at any depth.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::config::IndexConfig;
use crate::models::{content_hash, FileRecord};

/// Directory names never descended into.
const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "__pycache__",
    ".autodoc",
    "dist",
    "build",
    ".next",
    "target",
    ".venv",
    ".idea",
    ".vscode",
];

const UNKNOWN_LANGUAGE: &str = "unknown";

const EXTENSION_LANGUAGES: &[(&str, &str)] = &[
    ("go", "Go"),
    ("py", "Python"),
    ("pyi", "Python"),
    ("ts", "TypeScript"),
    ("tsx", "TypeScript"),
    ("mts", "TypeScript"),
    ("js", "JavaScript"),
    ("jsx", "JavaScript"),
    ("mjs", "JavaScript"),
    ("cjs", "JavaScript"),
    ("java", "Java"),
    ("rs", "Rust"),
    ("c", "C"),
    ("h", "C"),
    ("cpp", "C++"),
    ("cc", "C++"),
    ("cxx", "C++"),
    ("hpp", "C++"),
    ("cs", "C#"),
    ("rb", "Ruby"),
    ("php", "PHP"),
    ("swift", "Swift"),
    ("kt", "Kotlin"),
    ("kts", "Kotlin"),
    ("scala", "Scala"),
    ("sh", "Shell"),
    ("bash", "Shell"),
    ("zsh", "Shell"),
    ("sql", "SQL"),
    ("html", "HTML"),
    ("css", "CSS"),
    ("scss", "CSS"),
    ("yaml", "YAML"),
    ("yml", "YAML"),
    ("json", "JSON"),
    ("toml", "TOML"),
    ("tf", "Terraform"),
    ("md", "Markdown"),
    ("proto", "Protobuf"),
    ("lua", "Lua"),
    ("dart", "Dart"),
    ("ex", "Elixir"),
    ("exs", "Elixir"),
    ("hs", "Haskell"),
    ("vue", "Vue"),
    ("svelte", "Svelte"),
];

const FILENAME_LANGUAGES: &[(&str, &str)] = &[
    ("Dockerfile", "Dockerfile"),
    ("Makefile", "Makefile"),
    ("Jenkinsfile", "Groovy"),
    ("Gemfile", "Ruby"),
    ("Rakefile", "Ruby"),
];

/// Language name for a file name, or `"unknown"`.
pub fn detect_language(file_name: &str) -> &'static str {
    if let Some((_, lang)) = FILENAME_LANGUAGES.iter().find(|(name, _)| *name == file_name) {
        return lang;
    }
    let ext = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return UNKNOWN_LANGUAGE,
    };
    EXTENSION_LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
        .unwrap_or(UNKNOWN_LANGUAGE)
}

pub fn scan_with_config(config: &IndexConfig) -> Result<Vec<FileRecord>> {
    scan(
        &config.root,
        &config.include_globs,
        &config.exclude_globs,
        config.max_file_bytes,
    )
}

/// Walk `root` and return matching files sorted by relative path.
///
/// With no include globs, only files of a recognized language are kept.
/// Unreadable entries are skipped rather than failing the walk.
pub fn scan(
    root: &Path,
    include_globs: &[String],
    exclude_globs: &[String],
    max_file_bytes: u64,
) -> Result<Vec<FileRecord>> {
    if !root.is_dir() {
        bail!("Index root does not exist: {}", root.display());
    }
    let root = root.canonicalize()?;
    let include_set = build_globset(include_globs)?;
    let exclude_set = build_globset(exclude_globs)?;

    let mut files = Vec::new();
    let walker = WalkDir::new(&root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded_dir(e));

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        let file_name = entry.file_name().to_string_lossy().to_string();

        if matches(&exclude_set, &rel_str, &file_name) {
            continue;
        }
        let language = detect_language(&file_name);
        if include_globs.is_empty() {
            if language == UNKNOWN_LANGUAGE {
                continue;
            }
        } else if !matches(&include_set, &rel_str, &file_name) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.len() > max_file_bytes {
            continue;
        }
        let Ok(content) = std::fs::read(path) else {
            continue;
        };
        if is_binary(&content) {
            continue;
        }

        files.push(FileRecord {
            path: path.to_path_buf(),
            rel_path: rel_str,
            size: metadata.len(),
            language: language.to_string(),
            content_hash: content_hash(&content),
        });
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    Ok(files)
}

fn is_excluded_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| {
                DEFAULT_EXCLUDED_DIRS
                    .iter()
                    .any(|excluded| name.eq_ignore_ascii_case(excluded))
            })
            .unwrap_or(false)
}

/// NUL in the first 512 bytes means binary.
fn is_binary(content: &[u8]) -> bool {
    content.iter().take(512).any(|&b| b == 0)
}

fn matches(set: &GlobSet, rel_path: &str, file_name: &str) -> bool {
    set.is_match(rel_path) || set.is_match(file_name)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
