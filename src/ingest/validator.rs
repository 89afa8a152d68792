// Validator
// Schema enforcement for assembled ingest documents before they reach the
// sinks. A validation failure never aborts the batch: the orchestrator
// demotes the document to `parse_status=failed` with the error list and
// persists the metadata row.

use crate::store::records::{FileRecord, RelationRecord, SymbolRecord};
use crate::types::ParseStatus;

/// Fully assembled per-file ingest payload: the store row, the body text
/// destined for the text index, and the symbol/relation replacement set.
#[derive(Debug, Clone)]
pub struct IngestDocument {
    pub file: FileRecord,
    pub body_text: Option<String>,
    pub symbols: Vec<SymbolRecord>,
    pub relations: Vec<RelationRecord>,
}

/// Validate one document. Returns every violation, not just the first, so
/// failed rows carry a useful error list.
pub fn validate(doc: &IngestDocument, allow_metadata_only_ok: bool) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let file = &doc.file;

    let expected_doc_id = format!("{}/{}", file.root_id, doc_id_rel(doc));
    if file.doc_id.as_str() != expected_doc_id {
        errors.push(format!(
            "doc_id '{}' does not equal root_id/rel_path '{}'",
            file.doc_id, expected_doc_id
        ));
    }
    if file.repo != file.doc_id.repo() {
        errors.push(format!(
            "repo '{}' does not match first rel_path segment '{}'",
            file.repo,
            file.doc_id.repo()
        ));
    }

    match file.parse_status {
        ParseStatus::Ok => {
            let has_body = doc.body_text.as_ref().is_some_and(|b| !b.is_empty());
            if !has_body && doc.symbols.is_empty() && !allow_metadata_only_ok {
                errors.push(
                    "parse_status=ok requires body_text or at least one symbol".to_string(),
                );
            }
        }
        ParseStatus::Skipped | ParseStatus::Failed => {
            if doc.body_text.as_ref().is_some_and(|b| !b.is_empty()) {
                errors.push(format!(
                    "parse_status={} requires empty body_text",
                    file.parse_status.as_str()
                ));
            }
            if !doc.symbols.is_empty() {
                errors.push(format!(
                    "parse_status={} cannot carry symbols",
                    file.parse_status.as_str()
                ));
            }
        }
    }

    for symbol in &doc.symbols {
        if symbol.name.is_empty() {
            errors.push(format!("symbol at line {} has empty name", symbol.line));
        }
        if symbol.end_line < symbol.line {
            errors.push(format!(
                "symbol '{}' has end_line {} before line {}",
                symbol.name, symbol.end_line, symbol.line
            ));
        }
        if symbol.doc_id != file.doc_id {
            errors.push(format!(
                "symbol '{}' carries foreign doc_id '{}'",
                symbol.name, symbol.doc_id
            ));
        }
    }

    for relation in &doc.relations {
        if relation.from_symbol.is_empty() || relation.to_symbol.is_empty() {
            errors.push(format!("relation at line {} has empty endpoint", relation.line));
        }
        if relation.from_doc_id != file.doc_id {
            errors.push(format!(
                "relation at line {} carries foreign doc_id '{}'",
                relation.line, relation.from_doc_id
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn doc_id_rel(doc: &IngestDocument) -> &str {
    doc.file.doc_id.rel_path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocId, ParseReason, RootId, SymbolId, SymbolKind};

    fn doc_id(rel: &str) -> DocId {
        let root = RootId::parse("00112233aabbccdd").expect("root id");
        DocId::new(&root, rel).expect("doc id")
    }

    fn base(status: ParseStatus, reason: ParseReason) -> IngestDocument {
        let id = doc_id("app/a.py");
        IngestDocument {
            file: FileRecord {
                doc_id: id.clone(),
                root_id: id.root_id(),
                repo: id.repo().to_string(),
                mtime: 1,
                size: 10,
                content: None,
                content_compressed: false,
                content_hash: 1,
                parse_status: status,
                parse_reason: reason,
                ast_status: status,
                ast_reason: reason,
                is_binary: false,
                sampled: false,
                last_seen: 1,
                deleted_ts: None,
            },
            body_text: None,
            symbols: Vec::new(),
            relations: Vec::new(),
        }
    }

    #[test]
    fn test_ok_requires_body_or_symbol() {
        let doc = base(ParseStatus::Ok, ParseReason::None);
        let errors = validate(&doc, false).expect_err("must fail");
        assert!(errors.iter().any(|e| e.contains("parse_status=ok")));

        // Metadata-only ok is allowed under the policy flag.
        assert!(validate(&doc, true).is_ok());

        let mut with_body = base(ParseStatus::Ok, ParseReason::None);
        with_body.body_text = Some("x = 1".to_string());
        assert!(validate(&with_body, false).is_ok());
    }

    #[test]
    fn test_skipped_requires_empty_body() {
        let mut doc = base(ParseStatus::Skipped, ParseReason::Binary);
        assert!(validate(&doc, false).is_ok());
        doc.body_text = Some("leak".to_string());
        assert!(validate(&doc, false).is_err());
    }

    #[test]
    fn test_symbol_shape_checks() {
        let mut doc = base(ParseStatus::Ok, ParseReason::None);
        let id = doc.file.doc_id.clone();
        doc.symbols.push(SymbolRecord {
            symbol_id: SymbolId::derive(&id, "f"),
            doc_id: id.clone(),
            root_id: id.root_id(),
            name: "f".to_string(),
            qualname: "f".to_string(),
            kind: SymbolKind::Function,
            line: 10,
            end_line: 5,
            content: String::new(),
            parent_name: None,
            docstring: None,
        });
        let errors = validate(&doc, false).expect_err("must fail");
        assert!(errors.iter().any(|e| e.contains("end_line")));
    }

    #[test]
    fn test_repo_mismatch_detected() {
        let mut doc = base(ParseStatus::Skipped, ParseReason::NoParse);
        doc.file.repo = "wrong".to_string();
        let errors = validate(&doc, false).expect_err("must fail");
        assert!(errors.iter().any(|e| e.contains("repo")));
    }
}
