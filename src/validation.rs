// Input Validation
// Shared validation for relative paths, tags, topics, and search queries.
// Called from the validated type constructors and from tool argument parsing
// so the same rules apply at every boundary.

use anyhow::{ensure, Result};
use std::path::{Component, Path};

/// Validate a workspace-relative path as stored in doc ids.
///
/// # Invariants
/// - Non-empty, valid UTF-8 (enforced by the `&str` type)
/// - Forward slashes only
/// - No leading `./`, no `..` components, no absolute prefix
/// - No NUL bytes
pub fn validate_rel_path(rel_path: &str) -> Result<()> {
    ensure!(!rel_path.is_empty(), "rel_path cannot be empty");
    ensure!(!rel_path.contains('\0'), "rel_path contains NUL byte");
    ensure!(!rel_path.contains('\\'), "rel_path must use forward slashes");
    ensure!(!rel_path.starts_with('/'), "rel_path cannot be absolute");
    ensure!(
        !rel_path.starts_with("./"),
        "rel_path cannot start with './'"
    );
    ensure!(
        rel_path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != ".."),
        "rel_path contains empty or traversal segment: {rel_path}"
    );
    Ok(())
}

/// Normalize a filesystem path (relative to a root) into rel_path form.
///
/// Rejects paths that escape the root instead of silently clamping them.
pub fn normalize_rel_path(path: &Path) -> Result<String> {
    let mut segments: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(seg) => {
                let seg = seg
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("path is not valid UTF-8: {}", path.display()))?;
                segments.push(seg.to_string());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                ensure!(
                    segments.pop().is_some(),
                    "path escapes the workspace root: {}",
                    path.display()
                );
            }
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("expected a relative path, got: {}", path.display());
            }
        }
    }
    let rel = segments.join("/");
    validate_rel_path(&rel)?;
    Ok(rel)
}

/// Validate a snippet tag.
///
/// Non-empty, max 128 characters, limited to alphanumerics plus `-_.`.
pub fn validate_tag(tag: &str) -> Result<()> {
    ensure!(!tag.is_empty(), "tag cannot be empty");
    ensure!(tag.len() <= 128, "tag exceeds 128 characters");
    ensure!(
        tag.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "tag may only contain alphanumerics, dash, underscore, dot"
    );
    Ok(())
}

/// Validate a context topic.
pub fn validate_topic(topic: &str) -> Result<()> {
    let trimmed = topic.trim();
    ensure!(!trimmed.is_empty(), "topic cannot be empty");
    ensure!(trimmed.len() <= 256, "topic exceeds 256 characters");
    ensure!(!trimmed.contains('\0'), "topic contains NUL byte");
    Ok(())
}

/// Validate a search query string.
///
/// Queries are free-form but must be non-empty after trimming and bounded.
pub fn validate_query(query: &str) -> Result<&str> {
    let trimmed = query.trim();
    ensure!(!trimmed.is_empty(), "query cannot be empty");
    ensure!(trimmed.len() <= 1024, "query too long (max 1024 characters)");
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_rel_path_rules() {
        assert!(validate_rel_path("a.py").is_ok());
        assert!(validate_rel_path("backend/app/main.py").is_ok());
        assert!(validate_rel_path("").is_err());
        assert!(validate_rel_path("./a.py").is_err());
        assert!(validate_rel_path("a/../b.py").is_err());
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("win\\path.py").is_err());
        assert!(validate_rel_path("a//b.py").is_err());
    }

    #[test]
    fn test_normalize_resolves_cur_and_parent_dirs() {
        assert_eq!(
            normalize_rel_path(&PathBuf::from("a/./b/../c.py")).expect("normalizes"),
            "a/c.py"
        );
        assert!(normalize_rel_path(&PathBuf::from("../outside.py")).is_err());
        assert!(normalize_rel_path(&PathBuf::from("/abs/path.py")).is_err());
    }

    #[test]
    fn test_query_bounds() {
        assert_eq!(validate_query("  login  ").expect("valid"), "login");
        assert!(validate_query("   ").is_err());
        assert!(validate_query(&"x".repeat(2000)).is_err());
    }
}
