// Service Composition
// Wires the subsystems into one running service: store + writer task, text
// index + reader reload, parser registry, ingest pipeline, search and
// graph engines, sessions, read gate, and the tool registry. This is the
// single construction path shared by the daemon binary, the one-shot CLI
// commands, and the integration tests.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::SariConfig;
use crate::daemon::sessions::SessionManager;
use crate::graph::GraphEngine;
use crate::ingest::IngestPipeline;
use crate::parser::ParserRegistry;
use crate::registry::Registry;
use crate::search::SearchEngine;
use crate::store::wal::WalEntry;
use crate::store::Store;
use crate::text_index::TextIndexEngine;
use crate::tools::gate::ReadGate;
use crate::tools::{ServiceContext, ToolRegistry};
use crate::types::BootId;
use crate::workspace::WorkspaceManager;

/// One assembled service instance.
pub struct SariService {
    pub config: Arc<SariConfig>,
    pub store: Arc<Store>,
    pub text_index: Arc<TextIndexEngine>,
    pub workspace: Arc<WorkspaceManager>,
    pub pipeline: IngestPipeline,
    pub sessions: Arc<SessionManager>,
    pub tools: Arc<ToolRegistry>,
    pub registry: Arc<Registry>,
    pub boot_id: BootId,
    pub data_dir: PathBuf,
}

impl SariService {
    /// Assemble everything under one data root. `watch` enables the
    /// native filesystem watcher; one-shot commands leave it off.
    pub async fn build(
        data_dir: &Path,
        config: SariConfig,
        workspace_paths: &[PathBuf],
        watch: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        let config = Arc::new(config);
        let boot_id = BootId::generate();

        let store = Store::open(&data_dir.join("store"), config.store.clone())?;
        let (writer, _writer_task) = crate::store::writer::spawn_writer(store.clone())?;

        let text_index = TextIndexEngine::open(
            &data_dir.join("text_index"),
            config.text_index.max_doc_bytes,
            &config.config_hash(),
        )?;

        let workspace = Arc::new(WorkspaceManager::new());
        // Restore previously attached roots, then attach the requested ones.
        for record in store.roots() {
            if let Err(err) = workspace.restore(&record) {
                tracing::warn!(error = %err, "failed to restore root");
            }
        }
        for path in workspace_paths {
            let root = workspace
                .attach(path, None, config.indexing.follow_symlinks)
                .with_context(|| format!("failed to attach workspace {}", path.display()))?;
            let snapshot = config.config_hash();
            writer
                .commit(vec![WalEntry::PutRoot {
                    root: Box::new(root.to_record(snapshot)),
                }])
                .await?;
        }

        let parsers = Arc::new(ParserRegistry::with_defaults());
        let pipeline = IngestPipeline::start(
            config.clone(),
            store.clone(),
            writer.clone(),
            text_index.clone(),
            workspace.clone(),
            parsers,
            watch,
        )?;

        let search = Arc::new(SearchEngine::new(
            store.clone(),
            text_index.clone(),
            workspace.clone(),
            config.clone(),
        ));
        let graph = Arc::new(GraphEngine::new(store.clone()));
        let sessions = SessionManager::new(
            config.daemon.session_grace_secs,
            config.daemon.idle_sec,
        );
        let gate = Arc::new(ReadGate::new(config.budget.clone()));
        let registry = Arc::new(Registry::open(
            &data_dir.join("registry.json"),
            config.daemon.registry_ttl_secs,
        ));

        let ctx = Arc::new(ServiceContext {
            config: config.clone(),
            store: store.clone(),
            writer,
            text_index: text_index.clone(),
            search,
            graph,
            workspace: workspace.clone(),
            pipeline: pipeline.handle(),
            orchestrator: pipeline.orchestrator(),
            gate,
            sessions: sessions.clone(),
            registry: registry.clone(),
            boot_id: boot_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        });
        let tools = Arc::new(ToolRegistry::with_defaults(ctx));

        Ok(Self {
            config,
            store,
            text_index,
            workspace,
            pipeline,
            sessions,
            tools,
            registry,
            boot_id,
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Scan every active root synchronously (cold start, scan-once).
    pub async fn initial_scan(&self) -> Result<()> {
        for root in self.workspace.active() {
            self.pipeline.scan_root_now(&root.root_id).await?;
        }
        self.text_index.reload_reader();
        Ok(())
    }

    /// Rebuild the text index from the store (the store is the sole source
    /// of truth; the index is always reconstructible). Returns the number
    /// of documents fed back in.
    pub fn rebuild_text_index(&self) -> usize {
        self.text_index.clear();
        let mut count = 0usize;
        for file in self.store.list_files(None, None, usize::MAX) {
            let body = match file.parse_status {
                crate::types::ParseStatus::Ok => Store::decode_content(&file),
                _ => None,
            };
            self.text_index
                .upsert(&file.doc_id, body.as_deref(), file.mtime, file.size);
            count += 1;
        }
        self.text_index.mark_available();
        self.text_index.reload_reader();
        if let Err(err) = self.text_index.save() {
            tracing::warn!(error = %err, "failed to persist rebuilt text index");
        }
        count
    }

    /// Doc-count drift between the store and the text index.
    pub fn verify_text_index(&self) -> (usize, usize) {
        (self.store.stats().file_count, self.text_index.live_doc_count())
    }

    /// Graceful shutdown: stop the pipeline and persist indexes.
    pub async fn shutdown(self) -> Result<()> {
        self.pipeline.shutdown().await;
        Ok(())
    }
}
