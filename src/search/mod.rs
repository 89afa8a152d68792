// Hybrid Search Engine
// Merges text-index hits with store-side constraints and policy, ranks with
// the configured multipliers, and produces the normalized result shape.
// Ordering is deterministic, (score desc, mtime desc, path asc), and
// stable across identical queries within one index snapshot, which is what
// makes offset pagination trustworthy.

pub mod filters;
pub mod ranking;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::config::SariConfig;
use crate::errors::{ErrorCode, SariError};
use crate::store::records::SymbolRecord;
use crate::store::Store;
use crate::text_index::tokenizer;
use crate::text_index::TextIndexEngine;
use crate::types::{DocId, RootId, SymbolKind, ValidatedLimit};
use crate::workspace::WorkspaceManager;
use filters::SearchFilters;

/// How the total count is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalMode {
    #[default]
    Exact,
    Approx,
}

/// A search request after tool-level argument parsing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub repo: Option<String>,
    #[serde(default)]
    pub root_ids: Vec<String>,
    #[serde(default)]
    pub file_types: Vec<String>,
    pub path_pattern: Option<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub snippet_lines: Option<usize>,
    #[serde(default = "default_recency")]
    pub recency_boost: bool,
    #[serde(default)]
    pub total_mode: TotalMode,
}

fn default_recency() -> bool {
    true
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            recency_boost: true,
            ..Self::default()
        }
    }
}

/// One hit in the normalized result shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub repo: String,
    /// Equals doc_id: `root_id/rel_path`.
    pub path: String,
    pub score: f64,
    pub snippet: String,
    pub mtime: i64,
    pub size: u64,
    pub match_count: usize,
    pub file_type: String,
    pub hit_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    pub metadata: serde_json::Value,
    /// Line of the first body match, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMeta {
    /// -1 when total_mode=approx.
    pub total: i64,
    pub total_mode: TotalMode,
    pub engine: String,
    pub latency_ms: u64,
    pub index_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_pagination_warning: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub meta: SearchMeta,
}

pub struct SearchEngine {
    store: Arc<Store>,
    text_index: Arc<TextIndexEngine>,
    workspace: Arc<WorkspaceManager>,
    config: Arc<SariConfig>,
}

impl SearchEngine {
    pub fn new(
        store: Arc<Store>,
        text_index: Arc<TextIndexEngine>,
        workspace: Arc<WorkspaceManager>,
        config: Arc<SariConfig>,
    ) -> Self {
        Self {
            store,
            text_index,
            workspace,
            config,
        }
    }

    /// Execute a code/text search.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SariError> {
        let started = Instant::now();
        crate::observability::record(crate::observability::Counter::Searches);

        let query = crate::validation::validate_query(&request.query)
            .map_err(|e| SariError::invalid_args("query", e.to_string()))?;
        let limit = ValidatedLimit::clamp(request.limit.unwrap_or(10));

        // Root scoping: requested ids intersect the attached active roots.
        let roots = self.workspace.active();
        let allowed: Vec<RootId> = roots.iter().map(|r| r.root_id.clone()).collect();
        let mut scope: Vec<RootId> = Vec::new();
        for raw in &request.root_ids {
            let root_id = RootId::parse(raw)
                .map_err(|e| SariError::invalid_args("root_ids", e.to_string()))?;
            if allowed.contains(&root_id) {
                scope.push(root_id);
            }
        }
        if !request.root_ids.is_empty() && scope.is_empty() {
            return Err(SariError::new(
                ErrorCode::ErrRootOutOfScope,
                "requested root_ids are disjoint from the attached roots",
            )
            .with_hint("call status to list attached roots"));
        }

        let filters = SearchFilters::compile(
            request.repo.clone(),
            scope.clone(),
            request.file_types.clone(),
            request.path_pattern.clone(),
            request.exclude_patterns.clone(),
            &roots,
        )
        .map_err(|e| SariError::invalid_args("path_pattern", e.to_string()))?;

        let snippet_lines = request
            .snippet_lines
            .unwrap_or(self.config.search.default_snippet_lines)
            .clamp(1, 50);
        let now = Utc::now().timestamp();

        // Degraded path: substring scan over the store.
        if self.text_index.availability().is_some() {
            if !self.config.text_index.enable_fallback {
                return Err(SariError::engine_unavailable(
                    self.text_index
                        .availability()
                        .unwrap_or(crate::errors::EngineUnavailableReason::IndexMissing),
                ));
            }
            return Ok(self.fallback_search(
                query,
                &filters,
                &allowed,
                limit,
                request,
                snippet_lines,
                started,
            ));
        }

        let reader = self.text_index.reader();
        let text_hits = reader.query(query);
        let query_tokens: Vec<String> = tokenizer::analyze(query)
            .into_iter()
            .map(|t| t.text)
            .collect();

        let mut hits: Vec<SearchHit> = Vec::new();
        for text_hit in text_hits {
            if !allowed.contains(&text_hit.doc_id.root_id()) {
                continue;
            }
            if !filters.matches(&text_hit.doc_id) {
                continue;
            }
            if let Some(hit) =
                self.build_hit(&text_hit, &query_tokens, snippet_lines, now, request)
            {
                hits.push(hit);
            }
        }

        sort_hits(&mut hits);
        let response = self.paginate(
            hits,
            limit,
            request,
            "hybrid",
            reader.index_version(),
            false,
            started,
        );
        Ok(response)
    }

    /// Symbol-mode search straight against the store.
    pub fn symbol_search(
        &self,
        pattern: &str,
        kind: Option<SymbolKind>,
        limit: usize,
        docstring_required: bool,
    ) -> Vec<SymbolRecord> {
        let limit = ValidatedLimit::clamp(limit).get();
        self.store
            .symbols_matching(pattern, limit * 4)
            .into_iter()
            .filter(|s| kind.map_or(true, |k| s.kind == k))
            .filter(|s| !docstring_required || s.docstring.is_some())
            .take(limit)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn fallback_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        allowed: &[RootId],
        limit: ValidatedLimit,
        request: &SearchRequest,
        snippet_lines: usize,
        started: Instant,
    ) -> SearchResponse {
        let needles: Vec<String> = tokenizer::analyze(query)
            .into_iter()
            .map(|t| t.text)
            .collect();
        let mut hits: Vec<SearchHit> = Vec::new();

        self.store.for_each_body(|file, body| {
            if !allowed.contains(&file.root_id) || !filters.matches(&file.doc_id) {
                return true;
            }
            let folded = tokenizer::fold(body);
            if !needles.iter().all(|n| folded.contains(n.as_str())) {
                return true;
            }
            let first = needles
                .first()
                .and_then(|n| folded.find(n.as_str()))
                .unwrap_or(0);
            let line = line_of_offset(&folded, first);
            let match_count = needles
                .iter()
                .map(|n| folded.matches(n.as_str()).count())
                .sum();
            hits.push(SearchHit {
                doc_id: file.doc_id.as_str().to_string(),
                repo: file.repo.clone(),
                path: file.doc_id.as_str().to_string(),
                score: match_count as f64,
                snippet: extract_snippet(body, line, snippet_lines),
                mtime: file.mtime,
                size: file.size,
                match_count,
                file_type: file_type_of(&file.doc_id),
                hit_reason: "fallback_substring".to_string(),
                context_symbol: None,
                docstring: None,
                metadata: serde_json::json!({
                    "parse_status": file.parse_status.as_str(),
                }),
                line: Some(line),
            });
            // Bounded scan: stop once we have a comfortable overscan.
            hits.len() < (request.offset + limit.get()) * 4 + 50
        });

        sort_hits(&mut hits);
        self.paginate(
            hits,
            limit,
            request,
            "store-fallback",
            "fallback".to_string(),
            true,
            started,
        )
    }

    fn build_hit(
        &self,
        text_hit: &crate::text_index::TextHit,
        query_tokens: &[String],
        snippet_lines: usize,
        now: i64,
        request: &SearchRequest,
    ) -> Option<SearchHit> {
        let file = self.store.get_file(&text_hit.doc_id)?;
        let body = crate::store::Store::decode_content(&file);

        let line = match (text_hit.first_offset, &body) {
            (Some(offset), Some(body)) => Some(line_of_offset(body, offset as usize)),
            _ => None,
        };

        let context = line.and_then(|l| self.store.enclosing_symbol(&text_hit.doc_id, l));

        // A hit "via symbol" when a query token names a symbol in the file.
        let symbol_hit = context
            .as_ref()
            .filter(|s| token_names_symbol(query_tokens, &s.name))
            .cloned()
            .or_else(|| {
                self.store
                    .symbols_for(&text_hit.doc_id)
                    .into_iter()
                    .find(|s| token_names_symbol(query_tokens, &s.name))
            });

        let hit_reason = match (&symbol_hit, text_hit.path_only) {
            (Some(symbol), _) => format!("symbol:{}", symbol.name),
            (None, true) => "path".to_string(),
            (None, false) => "text".to_string(),
        };

        let snippet = match (&body, line) {
            (Some(body), Some(line)) => extract_snippet(body, line, snippet_lines),
            _ => symbol_hit
                .as_ref()
                .map(|s| {
                    s.content
                        .lines()
                        .take(snippet_lines)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default(),
        };

        let context_kind = context.as_ref().map(|s| s.kind);
        let score = ranking::final_score(
            text_hit.score,
            now,
            text_hit.mtime,
            context_kind,
            text_hit.exact_match,
            request.recency_boost,
            &self.config.search.ranking,
        );

        Some(SearchHit {
            doc_id: text_hit.doc_id.as_str().to_string(),
            repo: file.repo.clone(),
            path: text_hit.doc_id.as_str().to_string(),
            score,
            snippet,
            mtime: text_hit.mtime,
            size: text_hit.size,
            match_count: text_hit.match_count,
            file_type: file_type_of(&text_hit.doc_id),
            hit_reason,
            context_symbol: context.as_ref().map(|s| s.qualname.clone()),
            docstring: symbol_hit.and_then(|s| s.docstring),
            metadata: serde_json::json!({
                "parse_status": file.parse_status.as_str(),
                "sampled": file.sampled,
                "exact_match": text_hit.exact_match,
            }),
            line,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn paginate(
        &self,
        hits: Vec<SearchHit>,
        limit: ValidatedLimit,
        request: &SearchRequest,
        engine: &str,
        index_version: String,
        partial: bool,
        started: Instant,
    ) -> SearchResponse {
        let total = match request.total_mode {
            TotalMode::Exact => hits.len() as i64,
            TotalMode::Approx => -1,
        };
        let deep_pagination_warning = (request.offset > self.config.search.max_offset_depth)
            .then(|| {
                format!(
                    "offset {} exceeds the supported depth {}; narrow the query instead",
                    request.offset, self.config.search.max_offset_depth
                )
            });
        let page: Vec<SearchHit> = hits
            .into_iter()
            .skip(request.offset)
            .take(limit.get())
            .collect();
        SearchResponse {
            hits: page,
            meta: SearchMeta {
                total,
                total_mode: request.total_mode,
                engine: engine.to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
                index_version,
                deep_pagination_warning,
                partial,
            },
        }
    }
}

/// Deterministic ordering: score desc, mtime desc, path asc.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.mtime.cmp(&a.mtime))
            .then(a.path.cmp(&b.path))
    });
}

fn token_names_symbol(query_tokens: &[String], symbol_name: &str) -> bool {
    let folded = tokenizer::fold(symbol_name);
    query_tokens.iter().any(|t| t == &folded)
}

fn file_type_of(doc_id: &DocId) -> String {
    let rel = doc_id.rel_path();
    rel.rsplit('.')
        .next()
        .filter(|e| *e != rel && !e.contains('/'))
        .unwrap_or("")
        .to_lowercase()
}

fn line_of_offset(text: &str, offset: usize) -> u32 {
    let offset = offset.min(text.len());
    text[..offset].bytes().filter(|b| *b == b'\n').count() as u32 + 1
}

/// Up to `lines` lines centered on `line` (1-based).
fn extract_snippet(body: &str, line: u32, lines: usize) -> String {
    let all: Vec<&str> = body.lines().collect();
    if all.is_empty() {
        return String::new();
    }
    let center = (line as usize).saturating_sub(1).min(all.len() - 1);
    let before = lines / 2;
    let start = center.saturating_sub(before);
    let end = (start + lines).min(all.len());
    all[start..end].join("\n")
}
