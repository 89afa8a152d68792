// Collector
// Walks attached roots and produces FileItems with the include/exclude
// policy already applied. Policy precedence: the include_files allow-list
// overrides everything, then include_ext (empty set allows all), then
// exclude_dirs and exclude_globs, then max_file_bytes (0 = unlimited).
// Files outside every attached root are never emitted at all.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};

use crate::config::IndexingConfig;
use crate::types::{DocId, RootId};
use crate::workspace::Root;

/// One discovered file, policy-annotated.
#[derive(Debug, Clone)]
pub struct FileItem {
    pub root_id: RootId,
    pub doc_id: DocId,
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub repo: String,
    pub size: u64,
    pub mtime: i64,
    pub ext: String,
    /// Hard-excluded: the orchestrator deletes any prior row instead of
    /// indexing.
    pub is_excluded: bool,
}

/// Compiled include/exclude policy for one root.
pub struct CollectPolicy {
    include_files: Vec<String>,
    include_ext: Vec<String>,
    exclude_dirs: Vec<String>,
    exclude_globs: GlobSet,
    max_file_bytes: u64,
}

impl CollectPolicy {
    pub fn compile(config: &IndexingConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_globs {
            builder.add(
                Glob::new(pattern).with_context(|| format!("bad exclude glob '{pattern}'"))?,
            );
        }
        Ok(Self {
            include_files: config.include_files.clone(),
            include_ext: config
                .include_ext
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude_dirs: config.exclude_dirs.clone(),
            exclude_globs: builder.build().context("failed to build exclude globset")?,
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Whether a rel_path is excluded by policy. include_files wins over
    /// every other rule.
    pub fn is_excluded(&self, rel_path: &str, size: u64) -> bool {
        if self
            .include_files
            .iter()
            .any(|allowed| allowed == rel_path)
        {
            return false;
        }
        if !self.include_ext.is_empty() {
            let ext = rel_path
                .rsplit('.')
                .next()
                .filter(|e| *e != rel_path)
                .unwrap_or("")
                .to_lowercase();
            if !self.include_ext.contains(&ext) {
                return true;
            }
        }
        if rel_path
            .split('/')
            .any(|seg| self.exclude_dirs.iter().any(|d| d == seg))
        {
            return true;
        }
        if self.exclude_globs.is_match(rel_path) {
            return true;
        }
        if self.max_file_bytes > 0 && size > self.max_file_bytes {
            return true;
        }
        false
    }

    /// Directory-level pruning so excluded trees are never walked.
    fn skip_dir(&self, name: &str) -> bool {
        self.exclude_dirs.iter().any(|d| d == name)
    }
}

/// Walk one root and return its FileItems in deterministic path order.
pub fn collect_root(
    root: &Root,
    config: &IndexingConfig,
) -> Result<Vec<FileItem>> {
    let policy = CollectPolicy::compile(config)?;
    let mut items = Vec::new();
    walk(&root.real_path, root, &policy, config.follow_symlinks, &mut items)?;
    items.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(items)
}

/// Build the FileItem for a single known path (watcher events, index_file).
pub fn collect_one(root: &Root, abs_path: &Path, config: &IndexingConfig) -> Result<FileItem> {
    let policy = CollectPolicy::compile(config)?;
    let metadata = std::fs::symlink_metadata(abs_path)
        .with_context(|| format!("cannot stat {}", abs_path.display()))?;
    make_item(root, abs_path, &metadata, &policy)
}

fn walk(
    dir: &Path,
    root: &Root,
    policy: &CollectPolicy,
    follow_symlinks: bool,
    items: &mut Vec<FileItem>,
) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "unreadable directory skipped");
            return Ok(());
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "unreadable dir entry skipped");
                continue;
            }
        };
        let path = entry.path();
        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unstattable entry skipped");
                continue;
            }
        };

        if metadata.file_type().is_symlink() && !follow_symlinks {
            continue;
        }

        let resolved = if metadata.file_type().is_symlink() {
            match std::fs::metadata(&path) {
                Ok(target) => target,
                Err(_) => continue,
            }
        } else {
            metadata
        };

        if resolved.is_dir() {
            let name = entry.file_name();
            if policy.skip_dir(&name.to_string_lossy()) {
                continue;
            }
            walk(&path, root, policy, follow_symlinks, items)?;
        } else if resolved.is_file() {
            match make_item(root, &path, &resolved, policy) {
                Ok(item) => items.push(item),
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "uncollectable file skipped");
                }
            }
        }
    }
    Ok(())
}

fn make_item(
    root: &Root,
    abs_path: &Path,
    metadata: &std::fs::Metadata,
    policy: &CollectPolicy,
) -> Result<FileItem> {
    let rel = abs_path
        .strip_prefix(&root.real_path)
        .with_context(|| format!("path not under root: {}", abs_path.display()))?;
    let rel_path = crate::validation::normalize_rel_path(rel)?;
    let doc_id = DocId::new(&root.root_id, &rel_path)?;
    let size = metadata.len();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let ext = rel_path
        .rsplit('.')
        .next()
        .filter(|e| *e != rel_path && !e.contains('/'))
        .unwrap_or("")
        .to_lowercase();
    let is_excluded = policy.is_excluded(&rel_path, size);
    Ok(FileItem {
        root_id: root.root_id.clone(),
        repo: doc_id.repo().to_string(),
        doc_id,
        abs_path: abs_path.to_path_buf(),
        rel_path,
        size,
        mtime,
        ext,
        is_excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;

    fn setup() -> (tempfile::TempDir, Root) {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("app")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).expect("mkdir");
        std::fs::write(dir.path().join("app/main.py"), "def f(): pass\n").expect("write");
        std::fs::write(dir.path().join("app/data.bin"), [0u8, 1, 2]).expect("write");
        std::fs::write(dir.path().join("node_modules/pkg/x.js"), "login()\n").expect("write");
        std::fs::write(dir.path().join("README.md"), "# hi\n").expect("write");
        let manager = WorkspaceManager::new();
        let root = manager.attach(dir.path(), None, false).expect("attach");
        (dir, root)
    }

    #[test]
    fn test_exclude_dirs_prune_whole_trees() {
        let (_dir, root) = setup();
        let config = IndexingConfig::default();
        let items = collect_root(&root, &config).expect("collect");
        assert!(items.iter().all(|i| !i.rel_path.starts_with("node_modules")));
        assert!(items.iter().any(|i| i.rel_path == "app/main.py"));
    }

    #[test]
    fn test_include_ext_empty_allows_all() {
        let (_dir, root) = setup();
        let config = IndexingConfig::default();
        let items = collect_root(&root, &config).expect("collect");
        // No file is rejected by extension alone.
        assert!(items.iter().any(|i| i.rel_path == "README.md" && !i.is_excluded));
    }

    #[test]
    fn test_include_ext_filters_when_set() {
        let (_dir, root) = setup();
        let mut config = IndexingConfig::default();
        config.include_ext = vec!["py".to_string()];
        let items = collect_root(&root, &config).expect("collect");
        let md = items
            .iter()
            .find(|i| i.rel_path == "README.md")
            .expect("md collected");
        assert!(md.is_excluded);
        let py = items
            .iter()
            .find(|i| i.rel_path == "app/main.py")
            .expect("py collected");
        assert!(!py.is_excluded);
    }

    #[test]
    fn test_include_files_overrides_everything() {
        let (_dir, root) = setup();
        let mut config = IndexingConfig::default();
        config.include_ext = vec!["py".to_string()];
        config.include_files = vec!["README.md".to_string()];
        let items = collect_root(&root, &config).expect("collect");
        let md = items
            .iter()
            .find(|i| i.rel_path == "README.md")
            .expect("md collected");
        assert!(!md.is_excluded);
    }

    #[test]
    fn test_max_file_bytes_zero_never_rejects_by_size() {
        let (_dir, root) = setup();
        let mut config = IndexingConfig::default();
        config.max_file_bytes = 0;
        let items = collect_root(&root, &config).expect("collect");
        assert!(items.iter().all(|i| !i.is_excluded || i.rel_path.starts_with("node_modules")));
    }

    #[test]
    fn test_exclude_globs() {
        let (_dir, root) = setup();
        let mut config = IndexingConfig::default();
        config.exclude_dirs.clear();
        config.exclude_globs = vec!["node_modules/**".to_string()];
        let items = collect_root(&root, &config).expect("collect");
        let js = items
            .iter()
            .find(|i| i.rel_path == "node_modules/pkg/x.js")
            .expect("collected");
        assert!(js.is_excluded);
    }

    #[test]
    fn test_deterministic_order() {
        let (_dir, root) = setup();
        let config = IndexingConfig::default();
        let a = collect_root(&root, &config).expect("collect");
        let b = collect_root(&root, &config).expect("collect");
        let paths_a: Vec<&str> = a.iter().map(|i| i.rel_path.as_str()).collect();
        let paths_b: Vec<&str> = b.iter().map(|i| i.rel_path.as_str()).collect();
        assert_eq!(paths_a, paths_b);
    }
}
