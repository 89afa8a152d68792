// Discovery Tools
// status, list_files, repo_candidates: the orientation surface an agent
// calls before searching.

use globset::Glob;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_str, optional_u64, ServiceContext, ToolHandler};
use crate::errors::SariError;
use crate::types::{RootId, ValidatedLimit};

pub struct DiscoveryTools {
    ctx: Arc<ServiceContext>,
}

impl DiscoveryTools {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    fn status(&self) -> Value {
        let store_stats = self.ctx.store.stats();
        let engine = self.ctx.text_index.status();
        let queue_depth = self.ctx.pipeline.queue_depth();
        let roots: Vec<Value> = self
            .ctx
            .workspace
            .list()
            .into_iter()
            .map(|root| {
                json!({
                    "root_id": root.root_id.as_str(),
                    "root_path": root.root_path.to_string_lossy(),
                    "label": root.label,
                    "state": root.state,
                })
            })
            .collect();

        json!({
            "version": self.ctx.version,
            "boot_id": self.ctx.boot_id.as_str(),
            "uptime_secs": self.ctx.started_at.elapsed().as_secs(),
            "index_ready": queue_depth == 0 && !self.ctx.pipeline.is_saturated(),
            "queue_depth": queue_depth,
            "roots": roots,
            "sessions": self.ctx.sessions.len(),
            "store": store_stats,
            "engine": engine,
        })
    }

    fn list_files(&self, args: &Value) -> Result<Value, SariError> {
        let limit = ValidatedLimit::clamp(optional_u64(args, "limit").unwrap_or(100) as usize);
        let repo = optional_str(args, "repo").filter(|r| !r.is_empty());
        let root_id = match optional_str(args, "root_id") {
            Some(raw) => Some(
                RootId::parse(raw)
                    .map_err(|e| SariError::invalid_args("root_id", e.to_string()))?,
            ),
            None => None,
        };
        let pattern = match optional_str(args, "pattern").filter(|p| !p.is_empty() && *p != "*") {
            Some(raw) => Some(
                Glob::new(raw)
                    .map_err(|e| SariError::invalid_args("pattern", e.to_string()))?
                    .compile_matcher(),
            ),
            None => None,
        };

        let files: Vec<Value> = self
            .ctx
            .store
            .list_files(root_id.as_ref(), repo, usize::MAX)
            .into_iter()
            .filter(|f| {
                pattern
                    .as_ref()
                    .map_or(true, |p| p.is_match(f.doc_id.rel_path()))
            })
            .take(limit.get())
            .map(|f| {
                json!({
                    "path": f.doc_id.as_str(),
                    "repo": f.repo,
                    "size": f.size,
                    "mtime": f.mtime,
                    "parse_status": f.parse_status.as_str(),
                })
            })
            .collect();

        let total = files.len();
        Ok(json!({
            "files": files,
            "meta": { "total": total },
        }))
    }

    fn repo_candidates(&self, args: &Value) -> Result<Value, SariError> {
        let roots = match optional_str(args, "root_id") {
            Some(raw) => {
                let root_id = RootId::parse(raw)
                    .map_err(|e| SariError::invalid_args("root_id", e.to_string()))?;
                vec![root_id]
            }
            None => self
                .ctx
                .workspace
                .active()
                .into_iter()
                .map(|r| r.root_id)
                .collect(),
        };

        let mut candidates: Vec<Value> = Vec::new();
        for root_id in roots {
            for (repo, file_count, last_mtime) in self.ctx.store.repo_candidates(&root_id) {
                candidates.push(json!({
                    "root_id": root_id.as_str(),
                    "repo": repo,
                    "file_count": file_count,
                    "last_mtime": last_mtime,
                }));
            }
        }
        Ok(json!({ "candidates": candidates }))
    }
}

#[async_trait::async_trait]
impl ToolHandler for DiscoveryTools {
    fn tool_names(&self) -> &'static [&'static str] {
        &["status", "list_files", "repo_candidates"]
    }

    async fn handle(
        &self,
        tool: &str,
        args: Value,
        _session: &str,
    ) -> Result<Value, SariError> {
        match tool {
            "status" => Ok(self.status()),
            "list_files" => self.list_files(&args),
            "repo_candidates" => self.repo_candidates(&args),
            _ => Err(SariError::invalid_args("tool", format!("unroutable '{tool}'"))),
        }
    }
}
