// Workspace Management
// Maps filesystem paths to workspace roots and doc ids. A root is attached
// once, hashed once, and never silently re-hashed; every per-file key in the
// system is derived here so the `root_id/rel_path` discipline has a single
// owner.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::store::records::RootRecord;
use crate::types::{DocId, RootId, RootState};
use crate::validation::normalize_rel_path;

/// One attached workspace root.
#[derive(Debug, Clone)]
pub struct Root {
    pub root_id: RootId,
    pub root_path: PathBuf,
    pub real_path: PathBuf,
    pub label: String,
    pub state: RootState,
    pub follow_symlinks: bool,
}

impl Root {
    pub fn to_record(&self, config_snapshot: String) -> RootRecord {
        let now = Utc::now().timestamp();
        RootRecord {
            root_id: self.root_id.clone(),
            root_path: self.root_path.to_string_lossy().to_string(),
            real_path: self.real_path.to_string_lossy().to_string(),
            label: self.label.clone(),
            state: self.state,
            config_snapshot,
            created_ts: now,
            updated_ts: now,
        }
    }
}

/// Registry of attached roots for one daemon.
pub struct WorkspaceManager {
    roots: RwLock<BTreeMap<RootId, Root>>,
}

impl Default for WorkspaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceManager {
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Canonical key used by the registry's workspaces map.
    pub fn canonical_key(path: &Path) -> Result<String> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("cannot canonicalize workspace path {}", path.display()))?;
        Ok(canonical.to_string_lossy().to_string())
    }

    /// Attach a root, or return the existing attachment for the same
    /// canonical path. The id is derived exactly once per (path, flags).
    pub fn attach(&self, path: &Path, label: Option<String>, follow_symlinks: bool) -> Result<Root> {
        let real_path = path
            .canonicalize()
            .with_context(|| format!("cannot canonicalize root {}", path.display()))?;
        if !real_path.is_dir() {
            bail!("workspace root is not a directory: {}", real_path.display());
        }

        let root_id = RootId::derive(&real_path, follow_symlinks);
        let mut roots = self.roots.write();
        if let Some(existing) = roots.get(&root_id) {
            return Ok(existing.clone());
        }

        let label = label.unwrap_or_else(|| {
            real_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "workspace".to_string())
        });
        let root = Root {
            root_id: root_id.clone(),
            root_path: path.to_path_buf(),
            real_path,
            label,
            state: RootState::Active,
            follow_symlinks,
        };
        roots.insert(root_id, root.clone());
        Ok(root)
    }

    /// Restore a previously persisted root without re-hashing.
    pub fn restore(&self, record: &RootRecord) -> Result<Root> {
        let root = Root {
            root_id: record.root_id.clone(),
            root_path: PathBuf::from(&record.root_path),
            real_path: PathBuf::from(&record.real_path),
            label: record.label.clone(),
            state: record.state,
            follow_symlinks: false,
        };
        self.roots.write().insert(root.root_id.clone(), root.clone());
        Ok(root)
    }

    pub fn get(&self, root_id: &RootId) -> Option<Root> {
        self.roots.read().get(root_id).cloned()
    }

    /// All roots in deterministic (root_id) order.
    pub fn list(&self) -> Vec<Root> {
        self.roots.read().values().cloned().collect()
    }

    /// Active roots only.
    pub fn active(&self) -> Vec<Root> {
        self.roots
            .read()
            .values()
            .filter(|r| r.state == RootState::Active)
            .cloned()
            .collect()
    }

    pub fn set_state(&self, root_id: &RootId, state: RootState) -> Result<()> {
        let mut roots = self.roots.write();
        let root = roots
            .get_mut(root_id)
            .ok_or_else(|| anyhow::anyhow!("unknown root: {root_id}"))?;
        root.state = state;
        Ok(())
    }

    /// Find the root containing an absolute path. Files outside every
    /// attached root resolve to None and are never indexed.
    pub fn containing_root(&self, abs_path: &Path) -> Option<Root> {
        let roots = self.roots.read();
        roots
            .values()
            .filter(|r| r.state == RootState::Active)
            .filter(|r| abs_path.starts_with(&r.real_path))
            // Deepest match wins when roots nest.
            .max_by_key(|r| r.real_path.components().count())
            .cloned()
    }

    /// Build the doc id for an absolute path under an attached root.
    pub fn doc_id_for(&self, abs_path: &Path) -> Result<DocId> {
        let root = self
            .containing_root(abs_path)
            .ok_or_else(|| anyhow::anyhow!("path outside attached roots: {}", abs_path.display()))?;
        let rel = abs_path
            .strip_prefix(&root.real_path)
            .with_context(|| format!("path not under root {}", root.real_path.display()))?;
        let rel = normalize_rel_path(rel)?;
        DocId::new(&root.root_id, &rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_is_idempotent_per_canonical_path() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = WorkspaceManager::new();
        let a = manager.attach(dir.path(), None, false).expect("attach");
        let b = manager.attach(dir.path(), None, false).expect("attach again");
        assert_eq!(a.root_id, b.root_id);
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn test_doc_id_for_nested_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("backend/app")).expect("mkdir");
        std::fs::write(dir.path().join("backend/app/main.py"), "x = 1\n").expect("write");

        let manager = WorkspaceManager::new();
        let root = manager.attach(dir.path(), None, false).expect("attach");
        let doc_id = manager
            .doc_id_for(&dir.path().canonicalize().expect("canon").join("backend/app/main.py"))
            .expect("doc id");
        assert_eq!(doc_id.root_id(), root.root_id);
        assert_eq!(doc_id.rel_path(), "backend/app/main.py");
        assert_eq!(doc_id.repo(), "backend");
    }

    #[test]
    fn test_paths_outside_roots_are_rejected() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let other = tempfile::tempdir().expect("create other dir");
        let manager = WorkspaceManager::new();
        manager.attach(dir.path(), None, false).expect("attach");
        assert!(manager
            .doc_id_for(&other.path().canonicalize().expect("canon").join("a.py"))
            .is_err());
    }

    #[test]
    fn test_paused_roots_do_not_resolve() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = WorkspaceManager::new();
        let root = manager.attach(dir.path(), None, false).expect("attach");
        manager
            .set_state(&root.root_id, RootState::Paused)
            .expect("pause");
        assert!(manager
            .containing_root(&dir.path().canonicalize().expect("canon"))
            .is_none());
    }
}
