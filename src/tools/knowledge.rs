// Knowledge Tools
// save_snippet, get_snippet, archive_context, get_context: user-captured
// knowledge riding in the same store as the index. Snippets capture anchor
// context at save time so later reads can report drift; contexts are
// topic-keyed records with validity windows.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_str, optional_u64, required_str, ServiceContext, ToolHandler};
use crate::errors::{ErrorCode, SariError};
use crate::store::records::{ContextRecord, SnippetRecord};
use crate::store::wal::WalEntry;
use crate::types::{DocId, SnippetTag};

/// Lines of surrounding context captured with each snippet.
const ANCHOR_LINES: usize = 3;

pub struct KnowledgeTools {
    ctx: Arc<ServiceContext>,
}

impl KnowledgeTools {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    async fn save_snippet(&self, args: &Value) -> Result<Value, SariError> {
        let tag = SnippetTag::new(required_str(args, "tag")?)
            .map_err(|e| SariError::invalid_args("tag", e.to_string()))?;
        let path = required_str(args, "path")?;
        let doc_id = DocId::parse(path)
            .map_err(|e| SariError::invalid_args("path", e.to_string()))?;
        let start_line = optional_u64(args, "start_line")
            .ok_or_else(|| SariError::invalid_args("start_line", "required"))? as u32;
        let end_line = optional_u64(args, "end_line")
            .ok_or_else(|| SariError::invalid_args("end_line", "required"))? as u32;
        if start_line == 0 {
            return Err(SariError::invalid_args("start_line", "lines are 1-based"));
        }
        if end_line < start_line {
            return Err(SariError::invalid_args(
                "end_line",
                "end_line must be >= start_line",
            ));
        }

        let file = self
            .ctx
            .store
            .get_file(&doc_id)
            .ok_or_else(|| SariError::not_indexed(path))?;
        let body = crate::store::Store::decode_content(&file).unwrap_or_default();
        let lines: Vec<&str> = body.lines().collect();
        if start_line as usize > lines.len() {
            return Err(SariError::invalid_args(
                "start_line",
                format!("file has only {} lines", lines.len()),
            ));
        }
        let start = start_line as usize - 1;
        let end = (end_line as usize).min(lines.len());
        let content = lines[start..end].join("\n");

        let anchor_before: Vec<String> = lines[start.saturating_sub(ANCHOR_LINES)..start]
            .iter()
            .map(|l| l.to_string())
            .collect();
        let anchor_after: Vec<String> = lines[end..(end + ANCHOR_LINES).min(lines.len())]
            .iter()
            .map(|l| l.to_string())
            .collect();

        let now = Utc::now().timestamp();
        let prior = self.ctx.store.snippet(&tag);
        let snippet = SnippetRecord {
            tag: tag.clone(),
            root_id: doc_id.root_id(),
            doc_id,
            start_line,
            end_line: end as u32,
            content_hash: xxhash_rust::xxh3::xxh3_64(content.as_bytes()),
            content,
            anchor_before,
            anchor_after,
            note: optional_str(args, "note").map(String::from),
            created_ts: prior.as_ref().map(|p| p.created_ts).unwrap_or(now),
            updated_ts: now,
        };

        self.ctx
            .writer
            .commit(vec![WalEntry::PutSnippet {
                snippet: Box::new(snippet.clone()),
            }])
            .await
            .map_err(|e| SariError::from_internal(&e))?;

        Ok(json!({
            "saved": tag.as_str(),
            "snippet": snippet,
            "replaced": prior.is_some(),
        }))
    }

    fn get_snippet(&self, args: &Value) -> Result<Value, SariError> {
        let tag = SnippetTag::new(
            required_str(args, "tag").or_else(|_| required_str(args, "target"))?,
        )
        .map_err(|e| SariError::invalid_args("tag", e.to_string()))?;
        let Some(snippet) = self.ctx.store.snippet(&tag) else {
            return Err(SariError::new(
                ErrorCode::NotIndexed,
                format!("no snippet tagged '{}'", tag),
            )
            .with_hint("save_snippet captures a region under a tag first"));
        };
        let versions = self.ctx.store.snippet_versions(&tag);
        Ok(json!({
            "snippet": snippet,
            "history_versions": versions.len(),
        }))
    }

    async fn archive_context(&self, args: &Value) -> Result<Value, SariError> {
        let topic = required_str(args, "topic")?;
        crate::validation::validate_topic(topic)
            .map_err(|e| SariError::invalid_args("topic", e.to_string()))?;
        let content = required_str(args, "content")?;

        let tags: Vec<String> = args
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let related_files: Vec<DocId> = args
            .get("related_files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|raw| DocId::parse(raw).ok())
                    .collect()
            })
            .unwrap_or_default();

        let now = Utc::now().timestamp();
        let prior = self.ctx.store.context(topic.trim());
        let record = ContextRecord {
            topic: topic.trim().to_string(),
            content: content.to_string(),
            tags,
            related_files,
            valid_from: args.get("valid_from").and_then(Value::as_i64),
            valid_until: args.get("valid_until").and_then(Value::as_i64),
            deprecated: args
                .get("deprecated")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            created_ts: prior.as_ref().map(|p| p.created_ts).unwrap_or(now),
            updated_ts: now,
        };

        self.ctx
            .writer
            .commit(vec![WalEntry::PutContext {
                context: Box::new(record.clone()),
            }])
            .await
            .map_err(|e| SariError::from_internal(&e))?;
        Ok(json!({
            "archived": record.topic,
            "replaced": prior.is_some(),
        }))
    }

    fn get_context(&self, args: &Value) -> Result<Value, SariError> {
        if let Some(topic) = optional_str(args, "topic").filter(|t| !t.is_empty()) {
            let Some(record) = self.ctx.store.context(topic) else {
                return Err(SariError::new(
                    ErrorCode::NotIndexed,
                    format!("no context for topic '{topic}'"),
                )
                .with_hint("archive_context stores knowledge under a topic first"));
            };
            let now = Utc::now().timestamp();
            let expired = record
                .valid_until
                .is_some_and(|until| until < now);
            return Ok(json!({
                "context": record,
                "expired": expired,
            }));
        }
        if let Some(tag) = optional_str(args, "tag") {
            let records = self.ctx.store.contexts_tagged(tag);
            return Ok(json!({ "contexts": records }));
        }
        Err(SariError::invalid_args("topic", "pass topic or tag"))
    }
}

#[async_trait::async_trait]
impl ToolHandler for KnowledgeTools {
    fn tool_names(&self) -> &'static [&'static str] {
        &["save_snippet", "get_snippet", "archive_context", "get_context"]
    }

    async fn handle(&self, tool: &str, args: Value, _session: &str) -> Result<Value, SariError> {
        match tool {
            "save_snippet" => self.save_snippet(&args).await,
            "get_snippet" => self.get_snippet(&args),
            "archive_context" => self.archive_context(&args).await,
            "get_context" => self.get_context(&args),
            _ => Err(SariError::invalid_args("tool", format!("unroutable '{tool}'"))),
        }
    }
}
