// Store Records
// Row types persisted by the store. These are the durable shapes: every WAL
// entry and checkpoint is built from them, so changes here are format
// changes and need a schema-version bump in the checkpoint header.

use serde::{Deserialize, Serialize};

use crate::types::{
    DocId, ParseReason, ParseStatus, RelationType, RootId, RootState, SnippetTag, SymbolId,
    SymbolKind,
};

/// Indexed file row. Key: `doc_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub doc_id: DocId,
    pub root_id: RootId,
    pub repo: String,
    pub mtime: i64,
    pub size: u64,
    /// Stored body, possibly lz4-compressed (see `content_compressed`).
    /// Absent for skipped/failed files, which keep a metadata-only row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    pub content_compressed: bool,
    pub content_hash: u64,
    pub parse_status: ParseStatus,
    pub parse_reason: ParseReason,
    pub ast_status: ParseStatus,
    pub ast_reason: ParseReason,
    pub is_binary: bool,
    pub sampled: bool,
    pub last_seen: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_ts: Option<i64>,
}

impl FileRecord {
    /// Change-detection key. An upsert carrying the same triple is a no-op
    /// at both the store and the text index.
    pub fn fingerprint(&self) -> (i64, u64, u64) {
        (self.mtime, self.size, self.content_hash)
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_ts.is_some()
    }
}

/// Extracted symbol. Unique on `(doc_id, name, line)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub symbol_id: SymbolId,
    pub doc_id: DocId,
    pub root_id: RootId,
    pub name: String,
    pub qualname: String,
    pub kind: SymbolKind,
    pub line: u32,
    pub end_line: u32,
    /// Block text of the symbol body.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
}

/// Directed edge between symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub from_doc_id: DocId,
    pub from_root_id: RootId,
    pub from_symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_symbol_id: Option<SymbolId>,
    /// Target symbol name; resolution to a doc happens at query time since
    /// the callee may live in a file indexed later.
    pub to_symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_doc_id: Option<DocId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_symbol_id: Option<SymbolId>,
    pub rel_type: RelationType,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// User-captured code region, addressable by tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetRecord {
    pub tag: SnippetTag,
    pub doc_id: DocId,
    pub root_id: RootId,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub content_hash: u64,
    /// N lines of context captured at save time, used to report drift.
    pub anchor_before: Vec<String>,
    pub anchor_after: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// Prior content of a snippet, kept when the live row changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetVersion {
    pub tag: SnippetTag,
    pub version: u32,
    pub content: String,
    pub content_hash: u64,
    pub replaced_ts: i64,
}

/// Knowledge record keyed by topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub topic: String,
    pub content: String,
    pub tags: Vec<String>,
    pub related_files: Vec<DocId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<i64>,
    pub deprecated: bool,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// Retry queue entry for a file that failed to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub doc_id: DocId,
    pub attempts: u32,
    pub error: String,
    pub next_retry: i64,
    pub first_failed_ts: i64,
}

impl FailedTask {
    /// Backoff schedule after consecutive failures: 1m, 5m, then 1h.
    pub fn backoff_secs(attempts: u32) -> i64 {
        match attempts {
            0 | 1 => 60,
            2 => 300,
            _ => 3600,
        }
    }
}

/// Persisted workspace root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootRecord {
    pub root_id: RootId,
    pub root_path: String,
    pub real_path: String,
    pub label: String,
    pub state: RootState,
    pub config_snapshot: String,
    pub created_ts: i64,
    pub updated_ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_task_backoff_schedule() {
        assert_eq!(FailedTask::backoff_secs(1), 60);
        assert_eq!(FailedTask::backoff_secs(2), 300);
        assert_eq!(FailedTask::backoff_secs(3), 3600);
        assert_eq!(FailedTask::backoff_secs(9), 3600);
    }
}
