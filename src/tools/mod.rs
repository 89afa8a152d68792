// Tool Surface
// The tool registry and shared service context. Category handlers own
// their tool implementations; the registry routes by name, applies the
// stabilization block, and converts typed errors into the error envelope.
// Handlers never panic across this boundary: every outcome is an envelope.

pub mod discovery;
pub mod envelope;
pub mod gate;
pub mod graph_tools;
pub mod knowledge;
pub mod maintenance;
pub mod read_tools;
pub mod search_tools;

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SariConfig;
use crate::daemon::sessions::SessionManager;
use crate::errors::SariError;
use crate::graph::GraphEngine;
use crate::ingest::{Orchestrator, PipelineHandle};
use crate::registry::Registry;
use crate::search::SearchEngine;
use crate::store::writer::WriterHandle;
use crate::store::Store;
use crate::text_index::TextIndexEngine;
use crate::types::BootId;
use crate::workspace::WorkspaceManager;
use envelope::{err_envelope, ok_envelope, Stabilization};
use gate::ReadGate;

/// Shared state injected into every tool handler.
pub struct ServiceContext {
    pub config: Arc<SariConfig>,
    pub store: Arc<Store>,
    pub writer: WriterHandle,
    pub text_index: Arc<TextIndexEngine>,
    pub search: Arc<SearchEngine>,
    pub graph: Arc<GraphEngine>,
    pub workspace: Arc<WorkspaceManager>,
    pub pipeline: PipelineHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub gate: Arc<ReadGate>,
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<Registry>,
    pub boot_id: BootId,
    pub version: String,
    pub started_at: Instant,
}

/// One tool category. Mirrors the category split of the protocol surface.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tool names this handler serves, legacy aliases included.
    fn tool_names(&self) -> &'static [&'static str];

    /// Execute one tool; returns the payload fields of the envelope.
    async fn handle(&self, tool: &str, args: Value, session: &str)
        -> Result<Value, SariError>;
}

/// Name-routed registry over the category handlers.
pub struct ToolRegistry {
    ctx: Arc<ServiceContext>,
    handlers: Vec<Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Registry with every category registered.
    pub fn with_defaults(ctx: Arc<ServiceContext>) -> Self {
        let handlers: Vec<Arc<dyn ToolHandler>> = vec![
            Arc::new(discovery::DiscoveryTools::new(ctx.clone())),
            Arc::new(search_tools::SearchTools::new(ctx.clone())),
            Arc::new(read_tools::ReadTools::new(ctx.clone())),
            Arc::new(graph_tools::GraphTools::new(ctx.clone())),
            Arc::new(maintenance::MaintenanceTools::new(ctx.clone())),
            Arc::new(knowledge::KnowledgeTools::new(ctx.clone())),
        ];
        Self { ctx, handlers }
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .handlers
            .iter()
            .flat_map(|h| h.tool_names().iter().copied())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Execute a tool and produce the full response envelope.
    pub async fn execute(&self, tool: &str, args: Value, session: &str) -> Value {
        crate::observability::record(crate::observability::Counter::Operations);

        let Some(handler) = self
            .handlers
            .iter()
            .find(|h| h.tool_names().contains(&tool))
        else {
            let error = SariError::invalid_args("tool", format!("unknown tool '{tool}'"))
                .with_hint("call status to list available tools");
            return err_envelope(tool, &error, self.stabilization(session));
        };

        let target = args
            .get("target")
            .or_else(|| args.get("query"))
            .and_then(Value::as_str)
            .map(String::from);

        // Per-request deadline; a stuck handler becomes an error envelope,
        // never a hung connection.
        let outcome = match tokio::time::timeout(
            std::time::Duration::from_secs(30),
            handler.handle(tool, args, session),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SariError::new(
                crate::errors::ErrorCode::Internal,
                format!("tool '{tool}' exceeded its deadline"),
            )
            .with_hint("narrow the request, then retry")),
        };

        match outcome {
            Ok(payload) => ok_envelope(
                tool,
                target.as_deref(),
                payload,
                self.stabilization(session),
            ),
            Err(error) => {
                crate::observability::record(crate::observability::Counter::Errors);
                if error.code.is_fatal() {
                    tracing::error!(code = error.code.as_str(), "fatal invariant breach");
                }
                err_envelope(tool, &error, self.stabilization(session))
            }
        }
    }

    fn stabilization(&self, session: &str) -> Stabilization {
        let mut stabilization = Stabilization::ok();
        stabilization.budget_state = self.ctx.gate.budget_state(session);
        if stabilization.budget_state == "soft" {
            stabilization.suggested_next_action =
                Some("narrow scope with search before further reads".to_string());
        } else if stabilization.budget_state == "hard" {
            stabilization.suggested_next_action =
                Some("read only with candidate_ref from a fresh search".to_string());
        }
        // Ingest backpressure: reads still serve, large requests get the
        // soft-limit hint.
        if self.ctx.pipeline.is_saturated() {
            stabilization = stabilization.with_warning(
                crate::errors::ErrorCode::BudgetSoftLimit.as_str(),
                "ingest queue is saturated; prefer narrow queries until it drains",
            );
        }
        stabilization
    }
}

/// Pull a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, SariError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SariError::invalid_args(key, "required string"))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn optional_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}
