// Graph Tools
// get_callers, get_implementations, call_graph: relation navigation over
// the store's symbol graph.

use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_str, optional_u64, required_str, ServiceContext, ToolHandler};
use crate::errors::SariError;
use crate::graph::GraphDirection;

pub struct GraphTools {
    ctx: Arc<ServiceContext>,
}

impl GraphTools {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl ToolHandler for GraphTools {
    fn tool_names(&self) -> &'static [&'static str] {
        &["get_callers", "get_implementations", "call_graph"]
    }

    async fn handle(&self, tool: &str, args: Value, _session: &str) -> Result<Value, SariError> {
        let target = required_str(&args, "target").or_else(|_| required_str(&args, "symbol"))?;
        let limit = optional_u64(&args, "limit").unwrap_or(50).clamp(1, 200) as usize;

        match tool {
            "get_callers" => {
                let callers = self.ctx.graph.get_callers(target, limit);
                let total = callers.len();
                Ok(json!({
                    "symbol": target,
                    "callers": callers,
                    "meta": { "total": total },
                }))
            }
            "get_implementations" => {
                let implementations = self.ctx.graph.get_implementations(target, limit);
                let total = implementations.len();
                Ok(json!({
                    "symbol": target,
                    "implementations": implementations,
                    "meta": { "total": total },
                }))
            }
            "call_graph" => {
                let direction = match optional_str(&args, "direction").unwrap_or("callees") {
                    "callees" => GraphDirection::Callees,
                    "callers" => GraphDirection::Callers,
                    other => {
                        return Err(SariError::invalid_args(
                            "direction",
                            format!("'{other}' is not one of callees|callers"),
                        ))
                    }
                };
                let depth = optional_u64(&args, "depth").unwrap_or(3) as u32;
                let graph = self
                    .ctx
                    .graph
                    .call_graph(target, direction, depth, limit.max(20));
                Ok(json!({ "graph": graph }))
            }
            _ => Err(SariError::invalid_args("tool", format!("unroutable '{tool}'"))),
        }
    }
}
