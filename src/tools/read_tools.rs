// Read Tools
// The unified `read` tool (modes: file | symbol | snippet | diff_preview)
// and its legacy wrappers. All file/symbol reads pass the read gate:
// candidate_ref from a prior search, or a precision range within the hard
// cap. Diff previews are dry runs; nothing here writes.

use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_str, optional_u64, required_str, ServiceContext, ToolHandler};
use crate::errors::{ClientAction, ErrorCode, SariError};
use crate::types::{DocId, SnippetTag};

pub struct ReadTools {
    ctx: Arc<ServiceContext>,
}

impl ReadTools {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Accept either a full doc id or a workspace-relative path that is
    /// unique across the attached roots.
    fn resolve_doc(&self, target: &str) -> Result<DocId, SariError> {
        if let Ok(doc_id) = DocId::parse(target) {
            if self.ctx.store.get_file(&doc_id).is_some() {
                return Ok(doc_id);
            }
            return Err(SariError::not_indexed(target));
        }
        let rel = target.trim_start_matches("./");
        let candidates: Vec<DocId> = self
            .ctx
            .workspace
            .active()
            .into_iter()
            .filter_map(|root| DocId::new(&root.root_id, rel).ok())
            .filter(|doc_id| self.ctx.store.get_file(doc_id).is_some())
            .collect();
        let mut candidates = candidates.into_iter();
        match (candidates.next(), candidates.next()) {
            (None, _) => Err(SariError::not_indexed(target)),
            (Some(doc_id), None) => Ok(doc_id),
            (Some(_), Some(_)) => Err(SariError::invalid_args(
                "target",
                format!("'{target}' is ambiguous across roots; pass the full root_id/rel_path"),
            )),
        }
    }

    fn read_file(&self, args: &Value, session: &str) -> Result<Value, SariError> {
        let target = required_str(args, "target").or_else(|_| required_str(args, "path"))?;
        let doc_id = self.resolve_doc(target)?;
        let candidate_ref = optional_str(args, "candidate_ref");
        let start_line = optional_u64(args, "start_line").map(|v| v as u32);
        let end_line = optional_u64(args, "end_line").map(|v| v as u32);
        let precision = match (start_line, end_line) {
            (Some(start), Some(end)) => Some((start.max(1), end)),
            _ => None,
        };

        let text = self
            .ctx
            .store
            .read_file(&doc_id, None)
            .map_err(|e| SariError::from_internal(&e))?;
        let all_lines: Vec<&str> = text.text.lines().collect();

        let (slice_start, slice_end) = match precision {
            Some((start, end)) => (
                (start as usize - 1).min(all_lines.len()),
                (end as usize).min(all_lines.len()),
            ),
            None => (0, all_lines.len()),
        };
        let requested = slice_end.saturating_sub(slice_start);

        let allowance =
            self.ctx
                .gate
                .check_read(session, candidate_ref, precision, requested)?;

        let mut served_end = slice_end;
        let mut soft_limited = false;
        if let Some(cap) = allowance.truncate_to_lines {
            if requested > cap {
                served_end = slice_start + cap;
                soft_limited = true;
            }
        }
        let served = all_lines[slice_start..served_end].join("\n");
        let served_lines = served_end - slice_start;
        self.ctx.gate.record_read(session, served_lines);
        crate::observability::record(crate::observability::Counter::Reads);

        let mut payload = json!({
            "mode": "file",
            "path": doc_id.as_str(),
            "content": served,
            "start_line": slice_start + 1,
            "end_line": served_end,
            "text_truncated": text.text_truncated || soft_limited,
        });
        if soft_limited {
            payload["meta"] = json!({
                "reason_codes": [ErrorCode::SoftLimit.as_str()],
                "warnings": [format!(
                    "preview truncated to {served_lines} lines; pass a narrower range"
                )],
            });
        }
        Ok(payload)
    }

    fn read_symbol(&self, args: &Value, session: &str) -> Result<Value, SariError> {
        let target = required_str(args, "target")?;
        let candidate_ref = optional_str(args, "candidate_ref");

        let mut symbols = self.ctx.store.symbols_named(target);
        let mut fuzzy = false;
        if symbols.is_empty() {
            symbols = self.ctx.store.symbols_matching(target, 5);
            fuzzy = !symbols.is_empty();
        }
        if let Some(path) = optional_str(args, "path") {
            symbols.retain(|s| s.doc_id.as_str() == path || s.doc_id.rel_path() == path);
        }
        let Some(symbol) = symbols.first().cloned() else {
            return Err(SariError::new(
                ErrorCode::NotIndexed,
                format!("no symbol named '{target}' in the index"),
            )
            .with_hint("use search with mode=symbol to locate candidates")
            .with_action(ClientAction::SearchSymbol));
        };

        let lines = (symbol.end_line - symbol.line + 1) as usize;
        let gate_result = self.ctx.gate.check_read(session, candidate_ref, None, lines);
        let allowance = match gate_result {
            Ok(allowance) => allowance,
            Err(error) if error.code == ErrorCode::SearchRefRequired => {
                // A symbol read before any search gets the stronger gate.
                if !self.ctx.gate.has_searched(session) {
                    return Err(SariError::new(
                        ErrorCode::SearchFirstRequired,
                        "symbol reads require a prior search in this session",
                    )
                    .with_hint("run search first, then read with its candidate_ref"));
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        let mut content = symbol.content.clone();
        let mut soft_limited = false;
        if let Some(cap) = allowance.truncate_to_lines {
            if lines > cap {
                content = content.lines().take(cap).collect::<Vec<_>>().join("\n");
                soft_limited = true;
            }
        }
        self.ctx
            .gate
            .record_read(session, content.lines().count());
        crate::observability::record(crate::observability::Counter::Reads);

        let alternatives: Vec<Value> = symbols
            .iter()
            .skip(1)
            .take(4)
            .map(|s| json!({"path": s.doc_id.as_str(), "line": s.line, "qualname": s.qualname}))
            .collect();

        let mut payload = json!({
            "mode": "symbol",
            "path": symbol.doc_id.as_str(),
            "symbol": {
                "name": symbol.name,
                "qualname": symbol.qualname,
                "kind": symbol.kind.as_str(),
                "line": symbol.line,
                "end_line": symbol.end_line,
                "docstring": symbol.docstring,
            },
            "content": content,
            "text_truncated": soft_limited,
        });
        if !alternatives.is_empty() {
            payload["alternatives"] = Value::Array(alternatives);
        }
        // Fuzzy fallback: soft warning, the alternatives carry the options.
        if fuzzy {
            payload["meta"] = json!({
                "reason_codes": [ErrorCode::LowRelevance.as_str()],
                "warnings": [format!(
                    "no symbol named exactly '{target}'; returned the closest match"
                )],
            });
        }
        Ok(payload)
    }

    fn read_snippet(&self, args: &Value) -> Result<Value, SariError> {
        let target = required_str(args, "target").or_else(|_| required_str(args, "tag"))?;
        let tag = SnippetTag::new(target)
            .map_err(|e| SariError::invalid_args("tag", e.to_string()))?;
        let Some(snippet) = self.ctx.store.snippet(&tag) else {
            return Err(SariError::new(
                ErrorCode::NotIndexed,
                format!("no snippet tagged '{target}'"),
            )
            .with_hint("save_snippet captures a region under a tag first"));
        };

        // Drift report: does the live file still carry this content?
        let drifted = self
            .ctx
            .store
            .get_file(&snippet.doc_id)
            .and_then(|file| crate::store::Store::decode_content(&file))
            .map(|body| !body.contains(&snippet.content))
            .unwrap_or(true);

        Ok(json!({
            "mode": "snippet",
            "snippet": snippet,
            "drifted": drifted,
            "versions": self.ctx.store.snippet_versions(&tag).len(),
        }))
    }

    fn diff_preview(&self, args: &Value) -> Result<Value, SariError> {
        let target = required_str(args, "target").or_else(|_| required_str(args, "path"))?;
        let old_text = required_str(args, "old_text")?;
        let new_text = args
            .get("new_text")
            .and_then(Value::as_str)
            .ok_or_else(|| SariError::invalid_args("new_text", "required string"))?;
        let doc_id = self.resolve_doc(target)?;

        let text = self
            .ctx
            .store
            .read_file(&doc_id, Some(usize::MAX))
            .map_err(|e| SariError::from_internal(&e))?;
        let occurrences = text.text.matches(old_text).count();
        match occurrences {
            0 => Err(SariError::new(
                ErrorCode::VersionConflict,
                "old_text not found in the indexed content",
            )
            .with_hint("the file changed since it was read; re-read and adjust old_text")
            .with_action(ClientAction::AdjustOldText)),
            1 => {
                let offset = text.text.find(old_text).unwrap_or(0);
                let line = text.text[..offset].matches('\n').count() + 1;
                let before: Vec<String> = old_text
                    .lines()
                    .map(|l| format!("- {l}"))
                    .collect();
                let after: Vec<String> =
                    new_text.lines().map(|l| format!("+ {l}")).collect();
                Ok(json!({
                    "mode": "diff_preview",
                    "path": doc_id.as_str(),
                    "line": line,
                    "preview": format!("@@ line {line} @@\n{}\n{}", before.join("\n"), after.join("\n")),
                    "applies_cleanly": true,
                }))
            }
            n => Err(SariError::new(
                ErrorCode::VersionConflict,
                format!("old_text occurs {n} times; the edit is ambiguous"),
            )
            .with_hint("extend old_text with surrounding lines until it is unique")
            .with_action(ClientAction::FixArgs)),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for ReadTools {
    fn tool_names(&self) -> &'static [&'static str] {
        &["read", "read_file", "read_symbol", "dry_run_diff"]
    }

    async fn handle(&self, tool: &str, args: Value, session: &str) -> Result<Value, SariError> {
        let mode = match tool {
            "read" => optional_str(&args, "mode").unwrap_or("file").to_string(),
            "read_file" => "file".to_string(),
            "read_symbol" => "symbol".to_string(),
            "dry_run_diff" => "diff_preview".to_string(),
            _ => return Err(SariError::invalid_args("tool", format!("unroutable '{tool}'"))),
        };
        match mode.as_str() {
            "file" => self.read_file(&args, session),
            "symbol" => self.read_symbol(&args, session),
            "snippet" => self.read_snippet(&args),
            "diff_preview" => self.diff_preview(&args),
            other => Err(SariError::invalid_args(
                "mode",
                format!("'{other}' is not one of file|symbol|snippet|diff_preview"),
            )),
        }
    }
}
