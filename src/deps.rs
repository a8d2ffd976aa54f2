//! Change-set expansion through declared dependencies.
//!
//! When a file changes, files that declare a dependency on its directory
//! may need re-analysis too (their summaries mention the changed code).
//! Expansion is a breadth-first walk over a reverse-dependency relation
//! that is *derived heuristically* from dependency names: a dependency
//! "references" a directory if its name looks like that directory's
//! import path. See [`DirectoryHeuristic`] for the exact rules.
//!
//! The matching rule sits behind [`DependencyMatcher`] so a real
//! per-language import resolver can replace it without touching the walk.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::AnalysisResult;

/// Decides whether a dependency name refers to a directory of the tree.
pub trait DependencyMatcher: Send + Sync {
    fn matches(&self, dep_name: &str, dir: &str) -> bool;
}

/// Textual approximation of "this dependency imports that directory".
///
/// A dependency matches directory `d` when, after normalizing separators:
/// - it equals `d`,
/// - it ends with `/d` (`github.com/x/internal/config` vs `internal/config`),
/// - it equals the last segment of `d` (`config` vs `internal/config`), or
/// - it contains `/d/` as a component run.
///
/// Two unrelated packages sharing a final segment will match each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryHeuristic;

impl DependencyMatcher for DirectoryHeuristic {
    fn matches(&self, dep_name: &str, dir: &str) -> bool {
        let dep = dep_name.replace('\\', "/");
        let dir = dir.replace('\\', "/");

        if dep.is_empty() || dir.is_empty() || dir == "." {
            return false;
        }
        if dep == dir {
            return true;
        }
        if dep.ends_with(&format!("/{}", dir)) {
            return true;
        }
        let base = dir.rsplit('/').next().unwrap_or(&dir);
        if !base.is_empty() && base != "." && dep == base {
            return true;
        }
        dep.contains(&format!("/{}/", dir))
    }
}

/// Result of [`ChangeSetExpander::expand`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandedChangeSet {
    /// Directly changed files followed by dependency-affected ones.
    pub expanded: Vec<String>,
    /// Files pulled in only through dependency propagation, in discovery order.
    pub dependency_affected: Vec<String>,
}

/// Computes the transitive set of files that must be re-analyzed.
pub struct ChangeSetExpander<M = DirectoryHeuristic> {
    matcher: M,
}

impl Default for ChangeSetExpander<DirectoryHeuristic> {
    fn default() -> Self {
        Self::new(DirectoryHeuristic)
    }
}

impl<M: DependencyMatcher> ChangeSetExpander<M> {
    pub fn new(matcher: M) -> Self {
        Self { matcher }
    }

    /// Expand `changed` using the dependency lists recorded in `analyses`.
    ///
    /// With no recorded analyses there is nothing to propagate through and
    /// `changed` is returned as-is. Each file enters the queue at most once,
    /// so cyclic dependency graphs terminate.
    pub fn expand(
        &self,
        changed: &[String],
        analyses: &HashMap<String, AnalysisResult>,
    ) -> ExpandedChangeSet {
        if analyses.is_empty() {
            return ExpandedChangeSet {
                expanded: changed.to_vec(),
                dependency_affected: Vec::new(),
            };
        }

        // Sorted iteration keeps discovery order stable across runs.
        let mut known: Vec<(&String, &AnalysisResult)> = analyses.iter().collect();
        known.sort_by(|a, b| a.0.cmp(b.0));

        let mut visited: HashSet<&str> = changed.iter().map(String::as_str).collect();
        let mut dirty_dirs: Vec<String> = Vec::new();
        for path in changed {
            let dir = parent_dir(path);
            if !dirty_dirs.contains(&dir) {
                dirty_dirs.push(dir);
            }
        }

        let mut queue: VecDeque<&str> = VecDeque::new();
        for dir in &dirty_dirs {
            self.enqueue_dependents(dir, &known, &mut visited, &mut queue);
        }

        let mut affected = Vec::new();
        while let Some(current) = queue.pop_front() {
            affected.push(current.to_string());
            let dir = parent_dir(current);
            self.enqueue_dependents(&dir, &known, &mut visited, &mut queue);
        }

        let mut expanded = Vec::with_capacity(changed.len() + affected.len());
        expanded.extend(changed.iter().cloned());
        expanded.extend(affected.iter().cloned());

        ExpandedChangeSet {
            expanded,
            dependency_affected: affected,
        }
    }

    fn enqueue_dependents<'a>(
        &self,
        dir: &str,
        known: &[(&'a String, &'a AnalysisResult)],
        visited: &mut HashSet<&'a str>,
        queue: &mut VecDeque<&'a str>,
    ) {
        for &(path, analysis) in known {
            if visited.contains(path.as_str()) {
                continue;
            }
            if analysis
                .dependencies
                .iter()
                .any(|dep| self.matcher.matches(&dep.name, dir))
            {
                visited.insert(path.as_str());
                queue.push_back(path.as_str());
            }
        }
    }
}

/// Directory portion of a slash-separated relative path (`"."` at the root).
fn parent_dir(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    match normalized.rfind('/') {
        Some(idx) if idx > 0 => normalized[..idx].to_string(),
        _ => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dependency, DependencyKind};

    fn analysis(path: &str, deps: &[&str]) -> (String, AnalysisResult) {
        (
            path.to_string(),
            AnalysisResult {
                file_path: path.to_string(),
                dependencies: deps
                    .iter()
                    .map(|d| Dependency::new(*d, DependencyKind::Import))
                    .collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_directory_heuristic() {
        let m = DirectoryHeuristic;
        let cases = [
            ("internal/config", "internal/config", true),
            ("github.com/foo/internal/config", "internal/config", true),
            ("config", "internal/config", true),
            ("github.com/foo/internal/config/v2", "internal/config", true),
            ("github.com/foo/logging", "internal/config", false),
            ("", "internal/config", false),
            ("config", "", false),
            ("config", ".", false),
            ("myconfig", "internal/config", false),
        ];
        for (dep, dir, want) in cases {
            assert_eq!(m.matches(dep, dir), want, "matches({:?}, {:?})", dep, dir);
        }
    }

    #[test]
    fn test_no_deps_no_expansion() {
        let analyses: HashMap<_, _> = [
            analysis("cmd/main.go", &[]),
            analysis("internal/config/config.go", &[]),
        ]
        .into_iter()
        .collect();
        let result = ChangeSetExpander::default().expand(&["cmd/main.go".to_string()], &analyses);
        assert_eq!(result.expanded, vec!["cmd/main.go".to_string()]);
        assert!(result.dependency_affected.is_empty());
    }

    #[test]
    fn test_empty_analyses_returns_input() {
        let changed = vec!["a/x.go".to_string(), "b/y.go".to_string()];
        let result = ChangeSetExpander::default().expand(&changed, &HashMap::new());
        assert_eq!(result.expanded, changed);
        assert!(result.dependency_affected.is_empty());
    }

    #[test]
    fn test_direct_dependency() {
        let analyses: HashMap<_, _> = [
            analysis("internal/config/types.go", &[]),
            analysis("cmd/generate.go", &["github.com/foo/internal/config"]),
            analysis("internal/unrelated/foo.go", &["fmt"]),
        ]
        .into_iter()
        .collect();
        let result = ChangeSetExpander::default()
            .expand(&["internal/config/types.go".to_string()], &analyses);
        assert_eq!(result.expanded.len(), 2);
        assert_eq!(result.dependency_affected, vec!["cmd/generate.go".to_string()]);
    }

    #[test]
    fn test_transitive_dependency() {
        let analyses: HashMap<_, _> = [
            analysis("pkg/a/types.go", &[]),
            analysis("pkg/b/handler.go", &["pkg/a"]),
            analysis("pkg/c/service.go", &["pkg/b"]),
        ]
        .into_iter()
        .collect();
        let result =
            ChangeSetExpander::default().expand(&["pkg/a/types.go".to_string()], &analyses);

        let expanded: HashSet<_> = result.expanded.iter().cloned().collect();
        let expected: HashSet<_> = ["pkg/a/types.go", "pkg/b/handler.go", "pkg/c/service.go"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(expanded, expected);
        assert_eq!(
            result.dependency_affected,
            vec!["pkg/b/handler.go".to_string(), "pkg/c/service.go".to_string()]
        );
    }

    #[test]
    fn test_cycle_terminates() {
        let analyses: HashMap<_, _> = [
            analysis("pkg/a/a.go", &["pkg/b"]),
            analysis("pkg/b/b.go", &["pkg/a"]),
        ]
        .into_iter()
        .collect();
        let result = ChangeSetExpander::default().expand(&["pkg/a/a.go".to_string()], &analyses);
        assert_eq!(
            result.expanded,
            vec!["pkg/a/a.go".to_string(), "pkg/b/b.go".to_string()]
        );
        assert_eq!(result.dependency_affected, vec!["pkg/b/b.go".to_string()]);
    }

    #[test]
    fn test_custom_matcher() {
        struct Exact;
        impl DependencyMatcher for Exact {
            fn matches(&self, dep_name: &str, dir: &str) -> bool {
                dep_name == dir
            }
        }
        let analyses: HashMap<_, _> = [
            analysis("pkg/a/a.go", &[]),
            analysis("pkg/b/b.go", &["a"]),
            analysis("pkg/c/c.go", &["pkg/a"]),
        ]
        .into_iter()
        .collect();
        let result = ChangeSetExpander::new(Exact).expand(&["pkg/a/a.go".to_string()], &analyses);
        assert_eq!(result.dependency_affected, vec!["pkg/c/c.go".to_string()]);
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("pkg/a/types.go"), "pkg/a");
        assert_eq!(parent_dir("main.go"), ".");
        assert_eq!(parent_dir("pkg\\b\\x.go"), "pkg/b");
    }
}
