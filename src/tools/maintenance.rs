// Maintenance Tools
// index_file, rescan, scan_once, doctor: the operational surface. The
// doctor report is the one place every subsystem's health rolls up, with
// a concrete next step per finding.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_str, required_str, ServiceContext, ToolHandler};
use crate::errors::SariError;
use crate::ingest::queue::{IngestTask, PRIORITY_INTERACTIVE};
use crate::types::RootId;

pub struct MaintenanceTools {
    ctx: Arc<ServiceContext>,
}

impl MaintenanceTools {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    async fn index_file(&self, args: &Value) -> Result<Value, SariError> {
        let target = required_str(args, "target").or_else(|_| required_str(args, "path"))?;
        let abs_path = std::path::PathBuf::from(target);
        let doc_id = if abs_path.is_absolute() {
            self.ctx
                .workspace
                .doc_id_for(&abs_path)
                .map_err(|e| SariError::invalid_args("path", e.to_string()))?
        } else {
            crate::types::DocId::parse(target)
                .map_err(|e| SariError::invalid_args("path", e.to_string()))?
        };
        let abs_path = if abs_path.is_absolute() {
            abs_path
        } else {
            let root = self
                .ctx
                .workspace
                .get(&doc_id.root_id())
                .ok_or_else(|| SariError::not_indexed(target))?;
            root.real_path.join(doc_id.rel_path())
        };

        self.ctx
            .orchestrator
            .process(IngestTask::Upsert {
                doc_id: doc_id.clone(),
                abs_path,
            })
            .await
            .map_err(|e| SariError::from_internal(&e))?;
        Ok(json!({
            "indexed": doc_id.as_str(),
        }))
    }

    fn rescan(&self, args: &Value) -> Result<Value, SariError> {
        let roots: Vec<RootId> = match optional_str(args, "root_id") {
            Some(raw) => vec![RootId::parse(raw)
                .map_err(|e| SariError::invalid_args("root_id", e.to_string()))?],
            None => self
                .ctx
                .workspace
                .active()
                .into_iter()
                .map(|r| r.root_id)
                .collect(),
        };
        for root_id in &roots {
            self.ctx.pipeline.push(
                IngestTask::Rescan {
                    root_id: root_id.clone(),
                },
                PRIORITY_INTERACTIVE,
            );
        }
        Ok(json!({
            "enqueued": roots.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        }))
    }

    /// Synchronous one-shot scan of every active root.
    async fn scan_once(&self) -> Result<Value, SariError> {
        let mut scanned = Vec::new();
        for root in self.ctx.workspace.active() {
            self.ctx
                .orchestrator
                .rescan_root(&root.root_id)
                .await
                .map_err(|e| SariError::from_internal(&e))?;
            scanned.push(root.root_id.as_str().to_string());
        }
        let stats = self.ctx.store.stats();
        Ok(json!({
            "scanned_roots": scanned,
            "files": stats.file_count,
            "symbols": stats.symbol_count,
        }))
    }

    fn doctor(&self) -> Value {
        let now = Utc::now().timestamp();
        let store_stats = self.ctx.store.stats();
        let engine = self.ctx.text_index.status();
        let mut findings: Vec<Value> = Vec::new();

        // Text index drift against the store.
        let live_docs = self.ctx.text_index.live_doc_count();
        if live_docs != store_stats.file_count {
            findings.push(json!({
                "severity": "warning",
                "check": "index_drift",
                "detail": format!(
                    "text index holds {live_docs} docs, store holds {}",
                    store_stats.file_count
                ),
                "next_step": "run: sari engine rebuild",
            }));
        }
        if !engine.available {
            findings.push(json!({
                "severity": "error",
                "check": "engine",
                "detail": format!("text engine unavailable: {:?}", engine.unavailable_reason),
                "next_step": "run: sari engine rebuild",
            }));
        }

        // Failed-task queue, surfacing tripled-out items prominently.
        let failed = self.ctx.store.failed_tasks();
        for task in &failed {
            if task.attempts >= 3 {
                findings.push(json!({
                    "severity": "error",
                    "check": "failed_task",
                    "detail": format!(
                        "'{}' failed {} times: {}",
                        task.doc_id, task.attempts, task.error
                    ),
                    "next_step": format!("fix the file, then run: sari rescan ({}s until next retry)",
                        (task.next_retry - now).max(0)),
                }));
            }
        }

        // Registry liveness.
        let registry_health = match self.ctx.registry.read() {
            Ok(record) => json!({
                "daemons": record.daemons.len(),
                "workspaces": record.workspaces.len(),
                "deployment_state": record.deployment.state,
                "generation": record.deployment.generation,
            }),
            Err(err) => {
                findings.push(json!({
                    "severity": "error",
                    "check": "registry",
                    "detail": format!("registry unreadable: {err}"),
                    "next_step": "run: sari daemon status",
                }));
                json!(null)
            }
        };

        if store_stats.wal_bytes > 64 * 1024 * 1024 {
            findings.push(json!({
                "severity": "warning",
                "check": "wal_size",
                "detail": format!("WAL is {} bytes; checkpointing may be stalled", store_stats.wal_bytes),
                "next_step": "check write load, then run: sari daemon status",
            }));
        }

        let healthy = findings
            .iter()
            .all(|f| f["severity"].as_str() != Some("error"));
        json!({
            "healthy": healthy,
            "findings": findings,
            "store": store_stats,
            "engine": engine,
            "registry": registry_health,
            "failed_tasks": failed.len(),
            "queue_depth": self.ctx.pipeline.queue_depth(),
            "metrics": crate::observability::metrics_snapshot(),
        })
    }
}

#[async_trait::async_trait]
impl ToolHandler for MaintenanceTools {
    fn tool_names(&self) -> &'static [&'static str] {
        &["index_file", "rescan", "scan_once", "doctor"]
    }

    async fn handle(&self, tool: &str, args: Value, _session: &str) -> Result<Value, SariError> {
        match tool {
            "index_file" => self.index_file(&args).await,
            "rescan" => self.rescan(&args),
            "scan_once" => self.scan_once().await,
            "doctor" => Ok(self.doctor()),
            _ => Err(SariError::invalid_args("tool", format!("unroutable '{tool}'"))),
        }
    }
}
