// Single-Writer Transactional Store
// Durable persistence for files, symbols, relations, snippets, contexts,
// failed tasks, roots, and engine state. All mutation flows through one
// writer task holding the unique WriterToken; readers take cheap guarded
// views that never block the writer. Durability is WAL + checkpoint: a
// commit group is fsynced to the log before the in-memory tables change,
// and an idle checkpointer folds the log into a snapshot file.

pub mod records;
pub mod wal;
pub mod writer;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::store::records::{
    ContextRecord, FailedTask, FileRecord, RelationRecord, RootRecord, SnippetRecord,
    SnippetVersion, SymbolRecord,
};
use crate::store::wal::{Wal, WalEntry};
use crate::types::{DocId, RootId, SnippetTag};

const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// All in-memory tables. BTreeMaps keep iteration deterministic, which the
/// search tie-break and pagination guarantees rely on.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    files: BTreeMap<DocId, FileRecord>,
    symbols: BTreeMap<DocId, Vec<SymbolRecord>>,
    relations: BTreeMap<DocId, Vec<RelationRecord>>,
    snippets: BTreeMap<SnippetTag, SnippetRecord>,
    snippet_versions: BTreeMap<SnippetTag, Vec<SnippetVersion>>,
    contexts: BTreeMap<String, ContextRecord>,
    failed_tasks: BTreeMap<DocId, FailedTask>,
    roots: BTreeMap<RootId, RootRecord>,
    engine_state: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    schema_version: u32,
    tables: Tables,
}

/// Unforgeable capability held by the single writer task.
///
/// Only one token exists per store; the low-level commit path requires it,
/// so a second would-be writer cannot compile around the discipline and a
/// stale token is rejected at runtime.
#[derive(Debug)]
pub struct WriterToken {
    id: u64,
}

/// Guard that marks a read in flight, so the writer can yield under read
/// pressure. Dropping the guard releases the slot.
pub struct ReadGuard<'a> {
    store: &'a Store,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.store.in_flight_reads.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Result of a capped file read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileText {
    pub text: String,
    pub text_truncated: bool,
}

/// Aggregate counts for status and doctor reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub file_count: usize,
    pub tombstone_count: usize,
    pub symbol_count: usize,
    pub relation_count: usize,
    pub snippet_count: usize,
    pub context_count: usize,
    pub failed_task_count: usize,
    pub wal_bytes: u64,
}

pub struct Store {
    dir: PathBuf,
    config: StoreConfig,
    tables: RwLock<Tables>,
    wal: Mutex<Wal>,
    token_issued: AtomicBool,
    writer_id: AtomicU64,
    in_flight_reads: AtomicU64,
}

impl Store {
    /// Open the store under `dir`, creating the layout on first use and
    /// recovering from checkpoint + WAL replay otherwise.
    pub fn open(dir: &Path, config: StoreConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir.join("meta"))
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        let wal = Wal::open(&dir.join("wal"))?;

        let mut tables = Self::load_checkpoint(dir)?;
        let replayed = wal.replay()?;
        let replay_count = replayed.len();
        for entry in replayed {
            Self::apply_entry(&mut tables, entry);
        }
        if replay_count > 0 {
            tracing::info!(entries = replay_count, "replayed WAL into store");
        }

        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            config,
            tables: RwLock::new(tables),
            wal: Mutex::new(wal),
            token_issued: AtomicBool::new(false),
            writer_id: AtomicU64::new(0),
            in_flight_reads: AtomicU64::new(0),
        }))
    }

    fn checkpoint_path(dir: &Path) -> PathBuf {
        dir.join("meta").join("checkpoint.json")
    }

    fn load_checkpoint(dir: &Path) -> Result<Tables> {
        let path = Self::checkpoint_path(dir);
        if !path.exists() {
            return Ok(Tables::default());
        }
        let raw = std::fs::read(&path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        match serde_json::from_slice::<Checkpoint>(&raw) {
            Ok(cp) if cp.schema_version == CHECKPOINT_SCHEMA_VERSION => Ok(cp.tables),
            Ok(cp) => bail!(
                "checkpoint schema {} unsupported (expected {})",
                cp.schema_version,
                CHECKPOINT_SCHEMA_VERSION
            ),
            Err(err) => {
                // Corrupt checkpoint: fall back to WAL-only recovery rather
                // than refusing to start.
                tracing::error!(error = %err, "corrupt checkpoint, starting from WAL only");
                Ok(Tables::default())
            }
        }
    }

    /// Issue the unique writer token. The second caller gets the
    /// single-writer violation.
    pub fn take_writer_token(&self) -> Result<WriterToken> {
        if self.token_issued.swap(true, Ordering::SeqCst) {
            bail!("ERR_DB_WRITE_NOT_SINGLE_WRITER: writer token already issued");
        }
        let id = rand_token_id();
        self.writer_id.store(id, Ordering::SeqCst);
        Ok(WriterToken { id })
    }

    /// Apply a commit group: WAL first (fsynced), then in-memory tables.
    /// WAL failure leaves memory untouched, so the batch fails atomically.
    pub fn commit(&self, token: &WriterToken, entries: Vec<WalEntry>) -> Result<()> {
        if token.id != self.writer_id.load(Ordering::SeqCst) {
            bail!("ERR_DB_WRITE_NOT_SINGLE_WRITER: stale writer token");
        }
        if entries.is_empty() {
            return Ok(());
        }
        self.wal.lock().append_group(&entries)?;
        let mut tables = self.tables.write();
        for entry in entries {
            Self::apply_entry(&mut tables, entry);
        }
        Ok(())
    }

    /// Fold the WAL into a checkpoint snapshot. Only the writer may call
    /// this, and only while idle; the hot path never checkpoints.
    pub fn checkpoint(&self, token: &WriterToken) -> Result<()> {
        if token.id != self.writer_id.load(Ordering::SeqCst) {
            bail!("ERR_DB_WRITE_NOT_SINGLE_WRITER: stale writer token");
        }
        let serialized = {
            let tables = self.tables.read();
            serde_json::to_vec(&Checkpoint {
                schema_version: CHECKPOINT_SCHEMA_VERSION,
                tables: Tables {
                    files: tables.files.clone(),
                    symbols: tables.symbols.clone(),
                    relations: tables.relations.clone(),
                    snippets: tables.snippets.clone(),
                    snippet_versions: tables.snippet_versions.clone(),
                    contexts: tables.contexts.clone(),
                    failed_tasks: tables.failed_tasks.clone(),
                    roots: tables.roots.clone(),
                    engine_state: tables.engine_state.clone(),
                },
            })
            .context("failed to serialize checkpoint")?
        };

        let path = Self::checkpoint_path(&self.dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &serialized)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to publish checkpoint {}", path.display()))?;
        self.wal.lock().reset()?;
        tracing::debug!(bytes = serialized.len(), "checkpoint written");
        Ok(())
    }

    fn apply_entry(tables: &mut Tables, entry: WalEntry) {
        match entry {
            WalEntry::UpsertFile { file } => {
                tables.files.insert(file.doc_id.clone(), *file);
            }
            WalEntry::ReplaceSymbols {
                doc_id,
                symbols,
                relations,
            } => {
                if symbols.is_empty() {
                    tables.symbols.remove(&doc_id);
                } else {
                    tables.symbols.insert(doc_id.clone(), symbols);
                }
                if relations.is_empty() {
                    tables.relations.remove(&doc_id);
                } else {
                    tables.relations.insert(doc_id, relations);
                }
            }
            WalEntry::TombstoneFile { doc_id, deleted_ts } => {
                if let Some(file) = tables.files.get_mut(&doc_id) {
                    file.deleted_ts = Some(deleted_ts);
                    file.content = None;
                }
                tables.symbols.remove(&doc_id);
                tables.relations.remove(&doc_id);
            }
            WalEntry::GcTombstones { older_than } => {
                let doomed: Vec<DocId> = tables
                    .files
                    .iter()
                    .filter(|(_, f)| matches!(f.deleted_ts, Some(ts) if ts < older_than))
                    .map(|(id, _)| id.clone())
                    .collect();
                for doc_id in doomed {
                    tables.files.remove(&doc_id);
                    tables.symbols.remove(&doc_id);
                    tables.relations.remove(&doc_id);
                }
            }
            WalEntry::PutSnippet { snippet } => {
                let tag = snippet.tag.clone();
                if let Some(prior) = tables.snippets.get(&tag) {
                    // One new history version iff the content changed.
                    if prior.content_hash != snippet.content_hash {
                        let versions = tables.snippet_versions.entry(tag.clone()).or_default();
                        versions.push(SnippetVersion {
                            tag: tag.clone(),
                            version: versions.len() as u32 + 1,
                            content: prior.content.clone(),
                            content_hash: prior.content_hash,
                            replaced_ts: snippet.updated_ts,
                        });
                    }
                }
                tables.snippets.insert(tag, *snippet);
            }
            WalEntry::PutContext { context } => {
                tables.contexts.insert(context.topic.clone(), *context);
            }
            WalEntry::PutFailedTask { task } => {
                tables.failed_tasks.insert(task.doc_id.clone(), task);
            }
            WalEntry::ClearFailedTask { doc_id } => {
                tables.failed_tasks.remove(&doc_id);
            }
            WalEntry::PutRoot { root } => {
                tables.roots.insert(root.root_id.clone(), *root);
            }
            WalEntry::SetEngineState { key, value } => {
                tables.engine_state.insert(key, value);
            }
        }
    }

    // ---- Read side ----

    /// Mark a read in flight; the writer shrinks batches while guards live.
    pub fn read_guard(&self) -> ReadGuard<'_> {
        self.in_flight_reads.fetch_add(1, Ordering::Relaxed);
        ReadGuard { store: self }
    }

    pub fn read_pressure(&self) -> u64 {
        self.in_flight_reads.load(Ordering::Relaxed)
    }

    pub fn get_file(&self, doc_id: &DocId) -> Option<FileRecord> {
        let tables = self.tables.read();
        tables
            .files
            .get(doc_id)
            .filter(|f| !f.is_tombstone())
            .cloned()
    }

    /// Fingerprint of the live row, for unchanged-upsert no-op checks.
    pub fn file_fingerprint(&self, doc_id: &DocId) -> Option<(i64, u64, u64)> {
        let tables = self.tables.read();
        tables
            .files
            .get(doc_id)
            .filter(|f| !f.is_tombstone())
            .map(|f| f.fingerprint())
    }

    /// Decompress and decode a stored body.
    pub fn decode_content(file: &FileRecord) -> Option<String> {
        let raw = file.content.as_ref()?;
        if file.content_compressed {
            match lz4::block::decompress(raw, None) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
                Err(err) => {
                    tracing::warn!(doc_id = %file.doc_id, error = %err, "corrupt content block, skipping");
                    None
                }
            }
        } else {
            Some(String::from_utf8_lossy(raw).to_string())
        }
    }

    /// Compress a body for storage when it crosses the threshold.
    pub fn encode_content(&self, body: &str) -> (Vec<u8>, bool) {
        let bytes = body.as_bytes();
        if bytes.len() >= self.config.compress_threshold_bytes {
            match lz4::block::compress(bytes, None, true) {
                Ok(compressed) if compressed.len() < bytes.len() => return (compressed, true),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "lz4 compression failed, storing raw");
                }
            }
        }
        (bytes.to_vec(), false)
    }

    /// Read stored file text, enforcing the byte cap. Returns the prefix
    /// and `text_truncated=true` when the body is larger than the cap.
    pub fn read_file(&self, doc_id: &DocId, max_bytes: Option<usize>) -> Result<FileText> {
        let _guard = self.read_guard();
        let file = self
            .get_file(doc_id)
            .ok_or_else(|| anyhow::anyhow!("not indexed: {doc_id}"))?;
        let body = Self::decode_content(&file).unwrap_or_default();
        let cap = max_bytes.unwrap_or(self.config.max_read_bytes);
        if body.len() > cap {
            let mut end = cap;
            while end > 0 && !body.is_char_boundary(end) {
                end -= 1;
            }
            Ok(FileText {
                text: body[..end].to_string(),
                text_truncated: true,
            })
        } else {
            Ok(FileText {
                text: body,
                text_truncated: false,
            })
        }
    }

    /// Live files in deterministic doc-id order, optionally filtered by
    /// root and repo.
    pub fn list_files(
        &self,
        root_id: Option<&RootId>,
        repo: Option<&str>,
        limit: usize,
    ) -> Vec<FileRecord> {
        let _guard = self.read_guard();
        let tables = self.tables.read();
        tables
            .files
            .values()
            .filter(|f| !f.is_tombstone())
            .filter(|f| root_id.map_or(true, |r| &f.root_id == r))
            .filter(|f| repo.map_or(true, |r| f.repo == r))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every live file row (metadata only), for rescan reconciliation.
    pub fn all_live_doc_ids(&self, root_id: &RootId) -> Vec<DocId> {
        let tables = self.tables.read();
        tables
            .files
            .values()
            .filter(|f| !f.is_tombstone() && &f.root_id == root_id)
            .map(|f| f.doc_id.clone())
            .collect()
    }

    pub fn symbols_for(&self, doc_id: &DocId) -> Vec<SymbolRecord> {
        let tables = self.tables.read();
        tables.symbols.get(doc_id).cloned().unwrap_or_default()
    }

    /// Symbols whose name or qualname contains the (case-folded) pattern.
    pub fn symbols_matching(&self, pattern: &str, limit: usize) -> Vec<SymbolRecord> {
        let _guard = self.read_guard();
        let needle = pattern.to_lowercase();
        let tables = self.tables.read();
        let mut out = Vec::new();
        for symbols in tables.symbols.values() {
            for symbol in symbols {
                if symbol.name.to_lowercase().contains(&needle)
                    || symbol.qualname.to_lowercase().contains(&needle)
                {
                    out.push(symbol.clone());
                    if out.len() >= limit {
                        return out;
                    }
                }
            }
        }
        out
    }

    /// Exact-name symbol lookup.
    pub fn symbols_named(&self, name: &str) -> Vec<SymbolRecord> {
        let tables = self.tables.read();
        tables
            .symbols
            .values()
            .flatten()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// The innermost symbol block covering a line of a document.
    pub fn enclosing_symbol(&self, doc_id: &DocId, line: u32) -> Option<SymbolRecord> {
        let tables = self.tables.read();
        tables
            .symbols
            .get(doc_id)?
            .iter()
            .filter(|s| s.line <= line && line <= s.end_line)
            .min_by_key(|s| s.end_line - s.line)
            .cloned()
    }

    pub fn relations_for(&self, doc_id: &DocId) -> Vec<RelationRecord> {
        let tables = self.tables.read();
        tables.relations.get(doc_id).cloned().unwrap_or_default()
    }

    /// All relation rows, for graph construction.
    pub fn all_relations(&self) -> Vec<RelationRecord> {
        let _guard = self.read_guard();
        let tables = self.tables.read();
        tables.relations.values().flatten().cloned().collect()
    }

    pub fn snippet(&self, tag: &SnippetTag) -> Option<SnippetRecord> {
        let tables = self.tables.read();
        tables.snippets.get(tag).cloned()
    }

    pub fn snippet_versions(&self, tag: &SnippetTag) -> Vec<SnippetVersion> {
        let tables = self.tables.read();
        tables.snippet_versions.get(tag).cloned().unwrap_or_default()
    }

    pub fn context(&self, topic: &str) -> Option<ContextRecord> {
        let tables = self.tables.read();
        tables.contexts.get(topic).cloned()
    }

    pub fn contexts_tagged(&self, tag: &str) -> Vec<ContextRecord> {
        let tables = self.tables.read();
        tables
            .contexts
            .values()
            .filter(|c| !c.deprecated && c.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    pub fn failed_tasks(&self) -> Vec<FailedTask> {
        let tables = self.tables.read();
        tables.failed_tasks.values().cloned().collect()
    }

    pub fn due_failed_tasks(&self, now: i64) -> Vec<FailedTask> {
        let tables = self.tables.read();
        tables
            .failed_tasks
            .values()
            .filter(|t| t.next_retry <= now)
            .cloned()
            .collect()
    }

    pub fn roots(&self) -> Vec<RootRecord> {
        let tables = self.tables.read();
        tables.roots.values().cloned().collect()
    }

    pub fn engine_state(&self, key: &str) -> Option<String> {
        let tables = self.tables.read();
        tables.engine_state.get(key).cloned()
    }

    /// Repos under a root ranked by file count, then recency.
    pub fn repo_candidates(&self, root_id: &RootId) -> Vec<(String, usize, i64)> {
        let _guard = self.read_guard();
        let tables = self.tables.read();
        let mut by_repo: BTreeMap<&str, (usize, i64)> = BTreeMap::new();
        for file in tables.files.values() {
            if file.is_tombstone() || &file.root_id != root_id {
                continue;
            }
            let slot = by_repo.entry(file.repo.as_str()).or_insert((0, 0));
            slot.0 += 1;
            slot.1 = slot.1.max(file.mtime);
        }
        let mut out: Vec<(String, usize, i64)> = by_repo
            .into_iter()
            .map(|(repo, (count, mtime))| (repo.to_string(), count, mtime))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));
        out
    }

    /// Visit every live document body. Used by the substring fallback and
    /// the text-index rebuild; cancellation is observed between documents.
    pub fn for_each_body(&self, mut visit: impl FnMut(&FileRecord, &str) -> bool) {
        let _guard = self.read_guard();
        let tables = self.tables.read();
        for file in tables.files.values() {
            if file.is_tombstone() {
                continue;
            }
            if let Some(body) = Self::decode_content(file) {
                if !visit(file, &body) {
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        let tables = self.tables.read();
        StoreStats {
            file_count: tables.files.values().filter(|f| !f.is_tombstone()).count(),
            tombstone_count: tables.files.values().filter(|f| f.is_tombstone()).count(),
            symbol_count: tables.symbols.values().map(Vec::len).sum(),
            relation_count: tables.relations.values().map(Vec::len).sum(),
            snippet_count: tables.snippets.len(),
            context_count: tables.contexts.len(),
            failed_task_count: tables.failed_tasks.len(),
            wal_bytes: self.wal.lock().size_bytes(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

fn rand_token_id() -> u64 {
    // Uniqueness, not secrecy: the token is an in-process capability.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    (std::process::id() as u64) << 32 | nanos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParseReason, ParseStatus};

    fn sample_file(store: &Store, doc_id: &DocId, body: &str) -> FileRecord {
        let (content, compressed) = store.encode_content(body);
        FileRecord {
            doc_id: doc_id.clone(),
            root_id: doc_id.root_id(),
            repo: doc_id.repo().to_string(),
            mtime: 1_700_000_000,
            size: body.len() as u64,
            content: Some(content),
            content_compressed: compressed,
            content_hash: xxhash_rust::xxh3::xxh3_64(body.as_bytes()),
            parse_status: ParseStatus::Ok,
            parse_reason: ParseReason::None,
            ast_status: ParseStatus::Ok,
            ast_reason: ParseReason::None,
            is_binary: false,
            sampled: false,
            last_seen: 1_700_000_000,
            deleted_ts: None,
        }
    }

    fn doc(rel: &str) -> DocId {
        let root = RootId::parse("00112233aabbccdd").expect("root id");
        DocId::new(&root, rel).expect("doc id")
    }

    #[test]
    fn test_single_writer_token_is_unique() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let _token = store.take_writer_token().expect("first token");
        let second = store.take_writer_token();
        assert!(second.is_err());
        assert!(second
            .expect_err("must fail")
            .to_string()
            .contains("ERR_DB_WRITE_NOT_SINGLE_WRITER"));
    }

    #[test]
    fn test_commit_and_recover_via_wal() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let doc_id = doc("a.py");
        {
            let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
            let token = store.take_writer_token().expect("token");
            let file = sample_file(&store, &doc_id, "def login(): pass\n");
            store
                .commit(&token, vec![WalEntry::UpsertFile { file: Box::new(file) }])
                .expect("commit");
        }
        // Reopen without checkpoint: WAL replay restores the row.
        let store = Store::open(dir.path(), StoreConfig::default()).expect("reopen");
        let file = store.get_file(&doc_id).expect("file present after replay");
        assert_eq!(file.repo, "__root__");
        assert_eq!(
            Store::decode_content(&file).expect("body"),
            "def login(): pass\n"
        );
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let token = store.take_writer_token().expect("token");
        let file = sample_file(&store, &doc("a.py"), "x = 1\n");
        store
            .commit(&token, vec![WalEntry::UpsertFile { file: Box::new(file) }])
            .expect("commit");
        store.checkpoint(&token).expect("checkpoint");
        assert_eq!(store.stats().wal_bytes, 0);

        // And the data survives a reopen from the checkpoint alone.
        drop(store);
        let store = Store::open(dir.path(), StoreConfig::default()).expect("reopen");
        assert_eq!(store.stats().file_count, 1);
    }

    #[test]
    fn test_tombstone_then_gc_removes_rows() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let token = store.take_writer_token().expect("token");
        let doc_id = doc("gone.py");
        let file = sample_file(&store, &doc_id, "x = 1\n");
        store
            .commit(&token, vec![WalEntry::UpsertFile { file: Box::new(file) }])
            .expect("commit");
        store
            .commit(
                &token,
                vec![WalEntry::TombstoneFile {
                    doc_id: doc_id.clone(),
                    deleted_ts: 100,
                }],
            )
            .expect("tombstone");
        assert!(store.get_file(&doc_id).is_none());
        assert_eq!(store.stats().tombstone_count, 1);

        store
            .commit(&token, vec![WalEntry::GcTombstones { older_than: 200 }])
            .expect("gc");
        assert_eq!(store.stats().tombstone_count, 0);
    }

    #[test]
    fn test_snippet_history_only_on_content_change() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let token = store.take_writer_token().expect("token");
        let tag = SnippetTag::new("auth").expect("tag");
        let snippet = |content: &str, ts: i64| SnippetRecord {
            tag: tag.clone(),
            doc_id: doc("a.py"),
            root_id: doc("a.py").root_id(),
            start_line: 1,
            end_line: 2,
            content: content.to_string(),
            content_hash: xxhash_rust::xxh3::xxh3_64(content.as_bytes()),
            anchor_before: vec![],
            anchor_after: vec![],
            note: None,
            created_ts: ts,
            updated_ts: ts,
        };

        for (content, ts) in [("v1", 1), ("v1", 2), ("v2", 3)] {
            store
                .commit(
                    &token,
                    vec![WalEntry::PutSnippet {
                        snippet: Box::new(snippet(content, ts)),
                    }],
                )
                .expect("put snippet");
        }

        // Re-saving identical content produced no version; the real change
        // produced exactly one.
        let versions = store.snippet_versions(&tag);
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].content, "v1");
        assert_eq!(store.snippet(&tag).expect("live").content, "v2");
    }

    #[test]
    fn test_read_file_honors_byte_cap() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let token = store.take_writer_token().expect("token");
        let doc_id = doc("big.py");
        let body = "x".repeat(100);
        let file = sample_file(&store, &doc_id, &body);
        store
            .commit(&token, vec![WalEntry::UpsertFile { file: Box::new(file) }])
            .expect("commit");

        let read = store.read_file(&doc_id, Some(10)).expect("read");
        assert!(read.text_truncated);
        assert_eq!(read.text.len(), 10);

        let read = store.read_file(&doc_id, Some(1000)).expect("read");
        assert!(!read.text_truncated);
        assert_eq!(read.text.len(), 100);
    }

    #[test]
    fn test_compression_round_trip_over_threshold() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = StoreConfig::default();
        config.compress_threshold_bytes = 16;
        let store = Store::open(dir.path(), config).expect("open");
        let body = "def f():\n    return 42\n".repeat(50);
        let (encoded, compressed) = store.encode_content(&body);
        assert!(compressed);
        assert!(encoded.len() < body.len());

        let file = FileRecord {
            content: Some(encoded),
            content_compressed: true,
            ..sample_file(&store, &doc("c.py"), &body)
        };
        assert_eq!(Store::decode_content(&file).expect("decode"), body);
    }

    #[test]
    fn test_enclosing_symbol_picks_innermost() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let token = store.take_writer_token().expect("token");
        let doc_id = doc("a.py");
        let symbol = |name: &str, line: u32, end: u32| SymbolRecord {
            symbol_id: crate::types::SymbolId::derive(&doc_id, name),
            doc_id: doc_id.clone(),
            root_id: doc_id.root_id(),
            name: name.to_string(),
            qualname: name.to_string(),
            kind: crate::types::SymbolKind::Function,
            line,
            end_line: end,
            content: String::new(),
            parent_name: None,
            docstring: None,
        };
        store
            .commit(
                &token,
                vec![WalEntry::ReplaceSymbols {
                    doc_id: doc_id.clone(),
                    symbols: vec![symbol("outer", 1, 50), symbol("inner", 10, 20)],
                    relations: vec![],
                }],
            )
            .expect("commit");

        let hit = store.enclosing_symbol(&doc_id, 15).expect("enclosing");
        assert_eq!(hit.name, "inner");
        let hit = store.enclosing_symbol(&doc_id, 40).expect("enclosing");
        assert_eq!(hit.name, "outer");
    }
}
