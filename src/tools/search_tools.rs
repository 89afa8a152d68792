// Search Tools
// The unified `search` tool (modes: code | symbol | api | auto) plus the
// legacy `search_symbols` thin wrapper. Every response issues candidate
// refs so a follow-up read can pass the gate.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::{optional_str, ServiceContext, ToolHandler};
use crate::errors::SariError;
use crate::search::SearchRequest;
use crate::store::records::SymbolRecord;
use crate::types::SymbolKind;

pub struct SearchTools {
    ctx: Arc<ServiceContext>,
}

impl SearchTools {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    fn parse_request(args: &Value) -> Result<SearchRequest, SariError> {
        serde_json::from_value::<SearchRequest>(args.clone())
            .map_err(|e| SariError::invalid_args("search", e.to_string()))
    }

    fn symbol_hit(&self, symbol: &SymbolRecord, score: f64) -> Value {
        json!({
            "doc_id": symbol.doc_id.as_str(),
            "path": symbol.doc_id.as_str(),
            "repo": symbol.doc_id.repo(),
            "score": score,
            "snippet": symbol.content.lines().take(5).collect::<Vec<_>>().join("\n"),
            "line": symbol.line,
            "hit_reason": format!("symbol:{}", symbol.name),
            "context_symbol": symbol.qualname,
            "docstring": symbol.docstring,
            "kind": symbol.kind.as_str(),
            "match_count": 1,
        })
    }

    fn symbol_score(pattern: &str, symbol: &SymbolRecord) -> f64 {
        let name = symbol.name.to_lowercase();
        let pattern = pattern.to_lowercase();
        if name == pattern {
            2.0
        } else if name.starts_with(&pattern) {
            1.5
        } else {
            1.0
        }
    }

    async fn search(&self, args: &Value, session: &str) -> Result<Value, SariError> {
        let mode = optional_str(args, "mode").unwrap_or("auto");
        let request = Self::parse_request(args)?;
        crate::validation::validate_query(&request.query)
            .map_err(|e| SariError::invalid_args("query", e.to_string()))?;
        let kind = optional_str(args, "kind").and_then(SymbolKind::from_name);
        let limit = request.limit.unwrap_or(10);

        let (mut matches, meta): (Vec<Value>, Value) = match mode {
            "symbol" | "api" => {
                let symbols = self.ctx.search.symbol_search(
                    &request.query,
                    kind,
                    limit,
                    mode == "api",
                );
                let hits: Vec<Value> = symbols
                    .iter()
                    .map(|s| self.symbol_hit(s, Self::symbol_score(&request.query, s)))
                    .collect();
                let meta = json!({
                    "total": hits.len(),
                    "total_mode": "exact",
                    "engine": "symbol-store",
                    "index_version": self.ctx.text_index.reader().index_version(),
                });
                (hits, meta)
            }
            "code" => {
                let response = self.ctx.search.search(&request)?;
                let hits = response
                    .hits
                    .iter()
                    .map(|h| serde_json::to_value(h).unwrap_or(Value::Null))
                    .collect();
                (hits, serde_json::to_value(&response.meta).unwrap_or(Value::Null))
            }
            "auto" => {
                // Code search first; single-token identifier-looking
                // queries also merge exact symbol hits.
                let response = self.ctx.search.search(&request)?;
                let mut hits: Vec<Value> = response
                    .hits
                    .iter()
                    .map(|h| serde_json::to_value(h).unwrap_or(Value::Null))
                    .collect();
                let query = request.query.trim();
                if !query.contains(' ') {
                    for symbol in self.ctx.search.symbol_search(query, kind, limit, false) {
                        let path = symbol.doc_id.as_str();
                        if !hits
                            .iter()
                            .any(|h| h.get("path").and_then(Value::as_str) == Some(path))
                        {
                            hits.push(
                                self.symbol_hit(&symbol, Self::symbol_score(query, &symbol)),
                            );
                        }
                    }
                    hits.truncate(limit.clamp(1, 200));
                }
                (hits, serde_json::to_value(&response.meta).unwrap_or(Value::Null))
            }
            other => {
                return Err(SariError::invalid_args(
                    "mode",
                    format!("'{other}' is not one of code|symbol|api|auto"),
                ))
            }
        };

        // Issue candidate refs bound to this snapshot.
        let index_version = meta
            .get("index_version")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .to_string();
        let paths: Vec<String> = matches
            .iter()
            .filter_map(|h| h.get("path").and_then(Value::as_str).map(String::from))
            .collect();
        let refs = self.ctx.gate.issue_refs(session, &index_version, &paths);
        for (hit, candidate_ref) in matches.iter_mut().zip(refs) {
            if let Value::Object(fields) = hit {
                fields.insert("candidate_ref".to_string(), Value::String(candidate_ref));
            }
        }

        let mut payload = Map::new();
        payload.insert("matches".to_string(), Value::Array(matches));
        payload.insert("meta".to_string(), meta);
        Ok(Value::Object(payload))
    }
}

#[async_trait::async_trait]
impl ToolHandler for SearchTools {
    fn tool_names(&self) -> &'static [&'static str] {
        &["search", "search_symbols"]
    }

    async fn handle(&self, tool: &str, args: Value, session: &str) -> Result<Value, SariError> {
        match tool {
            "search" => self.search(&args, session).await,
            "search_symbols" => {
                // Thin wrapper: force symbol mode, map `pattern` onto
                // `query` for the legacy shape.
                let mut args = args;
                if let Value::Object(fields) = &mut args {
                    if let Some(pattern) = fields.remove("pattern") {
                        fields.entry("query".to_string()).or_insert(pattern);
                    }
                    fields.insert("mode".to_string(), Value::String("symbol".to_string()));
                }
                self.search(&args, session).await
            }
            _ => Err(SariError::invalid_args("tool", format!("unroutable '{tool}'"))),
        }
    }
}
