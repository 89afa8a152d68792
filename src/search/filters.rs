// Search Filters
// Store-side constraint evaluation for search requests. Categories AND
// together; within a category the values OR. Path patterns use glob
// (fnmatch) semantics over three candidates (rel_path, the full
// `root_id/rel_path`, and the first-segment-stripped rel_path), and
// absolute patterns are rewritten to rel_path form when they fall under an
// attached root, otherwise they match nothing. Exclusion is evaluated
// exactly, per hit, after candidate generation.

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};

use crate::types::{DocId, RootId};
use crate::workspace::Root;

/// Compiled filter set for one request.
pub struct SearchFilters {
    repo: Option<String>,
    root_ids: Vec<RootId>,
    /// Lowercased suffixes, dot included ("py" and ".py" both accepted).
    file_types: Vec<String>,
    path_pattern: Option<GlobMatcher>,
    /// A requested pattern that cannot apply (absolute, outside all roots)
    /// makes the whole filter match nothing.
    path_pattern_dead: bool,
    exclude_patterns: Vec<GlobMatcher>,
}

impl SearchFilters {
    pub fn compile(
        repo: Option<String>,
        root_ids: Vec<RootId>,
        file_types: Vec<String>,
        path_pattern: Option<String>,
        exclude_patterns: Vec<String>,
        roots: &[Root],
    ) -> Result<Self> {
        let mut path_pattern_dead = false;
        let path_pattern = match path_pattern {
            Some(raw) => match normalize_pattern(&raw, roots) {
                Some(pattern) => Some(
                    Glob::new(&pattern)
                        .with_context(|| format!("bad path_pattern '{pattern}'"))?
                        .compile_matcher(),
                ),
                None => {
                    path_pattern_dead = true;
                    None
                }
            },
            None => None,
        };

        let exclude_patterns = exclude_patterns
            .iter()
            .filter_map(|raw| normalize_pattern(raw, roots))
            .map(|pattern| {
                Glob::new(&pattern)
                    .with_context(|| format!("bad exclude pattern '{pattern}'"))
                    .map(|g| g.compile_matcher())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            repo,
            root_ids,
            file_types: file_types
                .into_iter()
                .map(|t| t.trim_start_matches('.').to_lowercase())
                .collect(),
            path_pattern,
            path_pattern_dead,
            exclude_patterns,
        })
    }

    /// Evaluate all filter categories against one document.
    pub fn matches(&self, doc_id: &DocId) -> bool {
        if self.path_pattern_dead {
            return false;
        }
        if let Some(repo) = &self.repo {
            if doc_id.repo() != repo {
                return false;
            }
        }
        if !self.root_ids.is_empty() && !self.root_ids.contains(&doc_id.root_id()) {
            return false;
        }
        if !self.file_types.is_empty() {
            let rel = doc_id.rel_path().to_lowercase();
            let matched = self.file_types.iter().any(|suffix| {
                rel.ends_with(&format!(".{suffix}")) || rel.ends_with(suffix.as_str())
            });
            if !matched {
                return false;
            }
        }

        let candidates = path_candidates(doc_id);
        if let Some(pattern) = &self.path_pattern {
            if !candidates.iter().any(|c| pattern.is_match(c)) {
                return false;
            }
        }
        // Exact exclusion post-filter: any candidate matching any pattern
        // drops the hit.
        if self
            .exclude_patterns
            .iter()
            .any(|pattern| candidates.iter().any(|c| pattern.is_match(c)))
        {
            return false;
        }
        true
    }
}

/// The three path forms a pattern may address.
fn path_candidates(doc_id: &DocId) -> Vec<String> {
    let rel = doc_id.rel_path();
    let mut candidates = vec![rel.to_string(), doc_id.as_str().to_string()];
    if let Some((_, stripped)) = rel.split_once('/') {
        candidates.push(stripped.to_string());
    }
    candidates
}

/// Rewrite an absolute pattern to rel_path form when it falls under an
/// attached root; None when it cannot apply anywhere.
fn normalize_pattern(raw: &str, roots: &[Root]) -> Option<String> {
    if !raw.starts_with('/') {
        return Some(raw.to_string());
    }
    for root in roots {
        let prefix = root.real_path.to_string_lossy().to_string();
        if let Some(stripped) = raw.strip_prefix(&prefix) {
            let stripped = stripped.trim_start_matches('/');
            if !stripped.is_empty() {
                return Some(stripped.to_string());
            }
        }
    }
    None
}
