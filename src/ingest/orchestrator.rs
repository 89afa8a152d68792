// Ingest Orchestrator
// Owns the transition into the single-writer sinks. Per document: policy
// check, load, parse (bounded), validate, then one logical commit covering
// the store row, the symbol/relation replacement, and the text-index
// upsert. A store failure rolls the document back entirely (the index is
// only touched after the store commit lands) and files a retry task;
// per-file failures never abort a batch.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SariConfig;
use crate::ingest::collector::{self, FileItem};
use crate::ingest::loader::{self, LoadOutcome};
use crate::ingest::queue::IngestTask;
use crate::ingest::validator::{self, IngestDocument};
use crate::parser::{ParseContext, ParseOutput, ParserRegistry};
use crate::store::records::{FailedTask, FileRecord, RelationRecord, SymbolRecord};
use crate::store::wal::WalEntry;
use crate::store::writer::WriterHandle;
use crate::store::Store;
use crate::text_index::TextIndexEngine;
use crate::types::{DocId, ParseReason, ParseStatus, RootId, SymbolId};
use crate::workspace::{Root, WorkspaceManager};

/// Hard ceiling on one parser invocation.
const PARSE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    store: Arc<Store>,
    writer: WriterHandle,
    text_index: Arc<TextIndexEngine>,
    parsers: Arc<ParserRegistry>,
    workspace: Arc<WorkspaceManager>,
    config: Arc<SariConfig>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        writer: WriterHandle,
        text_index: Arc<TextIndexEngine>,
        parsers: Arc<ParserRegistry>,
        workspace: Arc<WorkspaceManager>,
        config: Arc<SariConfig>,
    ) -> Self {
        Self {
            store,
            writer,
            text_index,
            parsers,
            workspace,
            config,
        }
    }

    /// Process one unit of work. Errors here are per-file: the caller logs
    /// and moves on, and a retry task has already been filed.
    pub async fn process(&self, task: IngestTask) -> Result<()> {
        match task {
            IngestTask::Upsert { doc_id, abs_path } => self.ingest_path(doc_id, &abs_path).await,
            IngestTask::Delete { doc_id } => self.delete_doc(&doc_id).await,
            IngestTask::Rescan { root_id } => self.rescan_root(&root_id).await,
        }
    }

    async fn ingest_path(&self, doc_id: DocId, abs_path: &Path) -> Result<()> {
        let Some(root) = self.workspace.get(&doc_id.root_id()) else {
            // Root detached since the event was queued; nothing to do.
            return Ok(());
        };

        let item = match collector::collect_one(&root, abs_path, &self.config.indexing) {
            Ok(item) => item,
            Err(_) => {
                // Path vanished between event and processing.
                return self.delete_doc(&doc_id).await;
            }
        };
        self.ingest_item(&root, item).await
    }

    /// Ingest an already-collected item.
    pub async fn ingest_item(&self, _root: &Root, item: FileItem) -> Result<()> {
        crate::observability::record(crate::observability::Counter::Operations);

        if item.is_excluded {
            // Hard exclude means not present: drop any prior row.
            if self.store.get_file(&item.doc_id).is_some() {
                self.delete_doc(&item.doc_id).await?;
            }
            return Ok(());
        }

        // Unchanged (mtime, size) means the content triple cannot have
        // changed either; the upsert is a no-op at both sinks.
        if let Some((mtime, size, _hash)) = self.store.file_fingerprint(&item.doc_id) {
            if mtime == item.mtime && size == item.size {
                return Ok(());
            }
        }

        let outcome = match loader::load(&item.abs_path, &self.config.indexing) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.file_retry(&item.doc_id, &err.to_string()).await;
                return Err(err);
            }
        };

        let document = self.assemble(&item, outcome).await;
        let entries = self.entries_for(&document);

        if let Err(err) = self.writer.commit(entries).await {
            // Store rejected the batch: the text index is untouched, so the
            // two sinks stay consistent for this doc. File a retry.
            self.file_retry(&item.doc_id, &err.to_string()).await;
            return Err(err);
        }

        // Store committed; mirror into the text index. Body only for
        // cleanly parsed documents.
        let body = if document.file.parse_status == ParseStatus::Ok {
            document.body_text.as_deref()
        } else {
            None
        };
        self.text_index
            .upsert(&item.doc_id, body, item.mtime, item.size);
        Ok(())
    }

    /// Build the validated ingest document for one loaded file.
    async fn assemble(&self, item: &FileItem, outcome: LoadOutcome) -> IngestDocument {
        let now = Utc::now().timestamp();
        let mut file = FileRecord {
            doc_id: item.doc_id.clone(),
            root_id: item.root_id.clone(),
            repo: item.repo.clone(),
            mtime: item.mtime,
            size: item.size,
            content: None,
            content_compressed: false,
            content_hash: outcome.content_hash,
            parse_status: ParseStatus::Skipped,
            parse_reason: ParseReason::NoParse,
            ast_status: ParseStatus::Skipped,
            ast_reason: ParseReason::NoParse,
            is_binary: outcome.is_binary,
            sampled: outcome.sampled,
            last_seen: now,
            deleted_ts: None,
        };

        if let Some(reason) = outcome.skip {
            file.parse_reason = reason;
            file.ast_reason = reason;
            return IngestDocument {
                file,
                body_text: None,
                symbols: Vec::new(),
                relations: Vec::new(),
            };
        }

        let body = outcome.body.unwrap_or_default();
        let parse_result = self.run_parsers(item, &body).await;

        let mut document = match parse_result {
            Ok(output) => {
                file.parse_status = ParseStatus::Ok;
                file.parse_reason = ParseReason::None;
                file.ast_status = ParseStatus::Ok;
                file.ast_reason = ParseReason::None;
                let (symbols, relations) = convert_output(&item.doc_id, &item.root_id, output);
                IngestDocument {
                    file,
                    body_text: Some(body),
                    symbols,
                    relations,
                }
            }
            Err(err) => {
                tracing::debug!(doc_id = %item.doc_id, error = %err, "parse failed");
                file.parse_status = ParseStatus::Failed;
                file.parse_reason = ParseReason::Error;
                file.ast_status = ParseStatus::Failed;
                file.ast_reason = ParseReason::Error;
                IngestDocument {
                    file,
                    body_text: None,
                    symbols: Vec::new(),
                    relations: Vec::new(),
                }
            }
        };

        if let Err(errors) = validator::validate(&document, self.config.indexing.allow_metadata_only_ok)
        {
            tracing::warn!(
                doc_id = %document.file.doc_id,
                errors = errors.len(),
                first = %errors.first().map(String::as_str).unwrap_or(""),
                "validation failed, demoting to failed row"
            );
            document.file.parse_status = ParseStatus::Failed;
            document.file.parse_reason = ParseReason::Error;
            document.body_text = None;
            document.symbols.clear();
            document.relations.clear();
        }

        // Stored content rides along only for cleanly parsed documents.
        if document.file.parse_status == ParseStatus::Ok {
            if let Some(body) = &document.body_text {
                let (encoded, compressed) = self.store.encode_content(body);
                document.file.content = Some(encoded);
                document.file.content_compressed = compressed;
            }
        }
        document
    }

    async fn run_parsers(&self, item: &FileItem, body: &str) -> Result<ParseOutput> {
        let parsers = Arc::clone(&self.parsers);
        let doc_id = item.doc_id.clone();
        let rel_path = item.rel_path.clone();
        let ext = item.ext.clone();
        let content = body.to_string();

        let parse = tokio::task::spawn_blocking(move || {
            let ctx = ParseContext {
                doc_id: &doc_id,
                rel_path: &rel_path,
                ext: &ext,
                content: &content,
                language_hint: None,
            };
            parsers.parse(&ctx).map(|(output, _parser)| output)
        });

        match tokio::time::timeout(PARSE_TIMEOUT, parse).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(anyhow!("parser task panicked: {join_err}")),
            Err(_) => Err(anyhow!("parser exceeded {}s budget", PARSE_TIMEOUT.as_secs())),
        }
    }

    fn entries_for(&self, document: &IngestDocument) -> Vec<WalEntry> {
        let mut entries = vec![WalEntry::UpsertFile {
            file: Box::new(document.file.clone()),
        }];
        entries.push(WalEntry::ReplaceSymbols {
            doc_id: document.file.doc_id.clone(),
            symbols: document.symbols.clone(),
            relations: document.relations.clone(),
        });
        entries.push(WalEntry::ClearFailedTask {
            doc_id: document.file.doc_id.clone(),
        });
        entries
    }

    pub async fn delete_doc(&self, doc_id: &DocId) -> Result<()> {
        let result = self
            .writer
            .commit(vec![WalEntry::TombstoneFile {
                doc_id: doc_id.clone(),
                deleted_ts: Utc::now().timestamp(),
            }])
            .await;
        if let Err(err) = result {
            // Deletion failures are demoted to warnings, never swallowed.
            tracing::warn!(doc_id = %doc_id, error = %err, "store deletion failed");
        }
        self.text_index.delete(doc_id);
        Ok(())
    }

    /// Full reconcile of one root: ingest everything visible, tombstone
    /// everything that is gone or newly excluded.
    pub async fn rescan_root(&self, root_id: &RootId) -> Result<()> {
        let Some(root) = self.workspace.get(root_id) else {
            return Ok(());
        };
        let items = collector::collect_root(&root, &self.config.indexing)?;

        let mut seen: HashSet<DocId> = HashSet::with_capacity(items.len());
        for item in items {
            seen.insert(item.doc_id.clone());
            if let Err(err) = self.ingest_item(&root, item).await {
                tracing::debug!(error = %err, "rescan item failed, continuing");
            }
        }

        for doc_id in self.store.all_live_doc_ids(root_id) {
            if !seen.contains(&doc_id) {
                self.delete_doc(&doc_id).await?;
            }
        }

        if let Err(err) = self.text_index.save() {
            tracing::warn!(error = %err, "text index save failed after rescan");
        }
        Ok(())
    }

    /// Record (or escalate) a failed task with exponential backoff.
    async fn file_retry(&self, doc_id: &DocId, error: &str) {
        let now = Utc::now().timestamp();
        let prior = self
            .store
            .failed_tasks()
            .into_iter()
            .find(|t| &t.doc_id == doc_id);
        let attempts = prior.as_ref().map(|t| t.attempts).unwrap_or(0) + 1;
        let task = FailedTask {
            doc_id: doc_id.clone(),
            attempts,
            error: error.to_string(),
            next_retry: now + FailedTask::backoff_secs(attempts),
            first_failed_ts: prior.map(|t| t.first_failed_ts).unwrap_or(now),
        };
        // Detached: if the writer itself is failing this will be retried by
        // the next sweep anyway.
        self.writer.commit_detached(vec![WalEntry::PutFailedTask { task }]);
        crate::observability::record(crate::observability::Counter::Errors);
    }
}

fn convert_output(
    doc_id: &DocId,
    root_id: &RootId,
    output: ParseOutput,
) -> (Vec<SymbolRecord>, Vec<RelationRecord>) {
    let mut symbols: Vec<SymbolRecord> = Vec::with_capacity(output.symbols.len());
    let mut seen: HashSet<(String, u32)> = HashSet::new();
    for parsed in output.symbols {
        // (doc, name, line) uniqueness is a schema invariant.
        if !seen.insert((parsed.name.clone(), parsed.line)) {
            continue;
        }
        symbols.push(SymbolRecord {
            symbol_id: SymbolId::derive(doc_id, &parsed.qualname),
            doc_id: doc_id.clone(),
            root_id: root_id.clone(),
            name: parsed.name,
            qualname: parsed.qualname,
            kind: parsed.kind,
            line: parsed.line,
            end_line: parsed.end_line,
            content: parsed.content,
            parent_name: parsed.parent_name,
            docstring: parsed.docstring,
        });
    }

    let relations = output
        .relations
        .into_iter()
        .map(|parsed| {
            let from_symbol_id = symbols
                .iter()
                .find(|s| s.name == parsed.from_symbol || s.qualname == parsed.from_symbol)
                .map(|s| s.symbol_id.clone());
            RelationRecord {
                from_doc_id: doc_id.clone(),
                from_root_id: root_id.clone(),
                from_symbol: parsed.from_symbol,
                from_symbol_id,
                to_symbol: parsed.to_symbol,
                to_doc_id: None,
                to_symbol_id: None,
                rel_type: parsed.rel_type,
                line: parsed.line,
                metadata: None,
            }
        })
        .collect();

    (symbols, relations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SariConfig;
    use crate::store::writer::spawn_writer;

    async fn setup(
        dir: &Path,
    ) -> (Orchestrator, Arc<Store>, Arc<TextIndexEngine>, Arc<WorkspaceManager>) {
        let config = Arc::new(SariConfig::default());
        let store = Store::open(&dir.join("store"), config.store.clone()).expect("open store");
        let (writer, _join) = spawn_writer(store.clone()).expect("spawn writer");
        let text_index = TextIndexEngine::open(
            &dir.join("text_index"),
            config.text_index.max_doc_bytes,
            &config.config_hash(),
        )
        .expect("open text index");
        let workspace = Arc::new(WorkspaceManager::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            writer,
            text_index.clone(),
            Arc::new(ParserRegistry::with_defaults()),
            workspace.clone(),
            config,
        );
        (orchestrator, store, text_index, workspace)
    }

    #[tokio::test]
    async fn test_ingest_then_rescan_reconciles() {
        let data = tempfile::tempdir().expect("data dir");
        let ws = tempfile::tempdir().expect("workspace dir");
        std::fs::write(ws.path().join("a.py"), "def login(user):\n    return user\n")
            .expect("write");
        std::fs::write(ws.path().join("b.py"), "class UserController:\n    pass\n")
            .expect("write");

        let (orchestrator, store, text_index, workspace) = setup(data.path()).await;
        let root = workspace.attach(ws.path(), None, false).expect("attach");

        orchestrator
            .rescan_root(&root.root_id)
            .await
            .expect("rescan");
        assert_eq!(store.stats().file_count, 2);
        assert!(!store.symbols_named("login").is_empty());

        text_index.reload_reader();
        assert_eq!(text_index.reader().query("login").len(), 1);

        // Remove a file; the next rescan tombstones it in both sinks.
        std::fs::remove_file(ws.path().join("a.py")).expect("remove");
        orchestrator
            .rescan_root(&root.root_id)
            .await
            .expect("rescan");
        assert_eq!(store.stats().file_count, 1);
        text_index.reload_reader();
        assert!(text_index.reader().query("login").is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_upsert_is_noop() {
        let data = tempfile::tempdir().expect("data dir");
        let ws = tempfile::tempdir().expect("workspace dir");
        std::fs::write(ws.path().join("a.py"), "x = 1\n").expect("write");

        let (orchestrator, _store, text_index, workspace) = setup(data.path()).await;
        let root = workspace.attach(ws.path(), None, false).expect("attach");
        orchestrator.rescan_root(&root.root_id).await.expect("rescan");

        text_index.reload_reader();
        let version = text_index.reader().index_version();
        let doc_count = text_index.reader().doc_count();

        // Same content, same mtime: the second pass must not touch either
        // sink.
        orchestrator.rescan_root(&root.root_id).await.expect("rescan");
        text_index.reload_reader();
        assert_eq!(text_index.reader().doc_count(), doc_count);
        assert_eq!(text_index.reader().index_version(), version);
    }

    #[tokio::test]
    async fn test_excluded_path_removes_prior_row() {
        let data = tempfile::tempdir().expect("data dir");
        let ws = tempfile::tempdir().expect("workspace dir");
        std::fs::create_dir_all(ws.path().join("vendor")).expect("mkdir");
        std::fs::write(ws.path().join("vendor/x.py"), "def hidden(): pass\n").expect("write");

        let (orchestrator, store, _text_index, workspace) = setup(data.path()).await;
        let root = workspace.attach(ws.path(), None, false).expect("attach");
        orchestrator.rescan_root(&root.root_id).await.expect("rescan");
        assert_eq!(store.stats().file_count, 1);

        // Tighten policy and reprocess: the row must go away.
        let mut config = SariConfig::default();
        config.indexing.exclude_globs = vec!["vendor/**".to_string()];
        let reconfigured = Orchestrator::new(
            store.clone(),
            orchestrator.writer.clone(),
            orchestrator.text_index.clone(),
            Arc::new(ParserRegistry::with_defaults()),
            workspace.clone(),
            Arc::new(config),
        );
        reconfigured
            .rescan_root(&root.root_id)
            .await
            .expect("rescan");
        assert_eq!(store.stats().file_count, 0);
    }

    #[tokio::test]
    async fn test_binary_file_keeps_metadata_row() {
        let data = tempfile::tempdir().expect("data dir");
        let ws = tempfile::tempdir().expect("workspace dir");
        std::fs::write(ws.path().join("blob.bin"), [0u8, 1, 2, 3]).expect("write");

        let (orchestrator, store, text_index, workspace) = setup(data.path()).await;
        let root = workspace.attach(ws.path(), None, false).expect("attach");
        orchestrator.rescan_root(&root.root_id).await.expect("rescan");

        let files = store.list_files(Some(&root.root_id), None, 10);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].parse_status, ParseStatus::Skipped);
        assert_eq!(files[0].parse_reason, ParseReason::Binary);
        assert!(files[0].is_binary);
        assert!(files[0].content.is_none());

        // Path text still searchable, body absent.
        text_index.reload_reader();
        let hits = text_index.reader().query("blob");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].path_only);
    }
}
