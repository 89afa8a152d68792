// Parser Registry
// Deterministic selection and invocation of language/heuristic parsers.
// Parsers are pure: no I/O, no state, only the provided content. Selection
// is reproducible (extension candidates, can_handle filter, language
// parsers before heuristics, priority, then registration order), so the
// same file always meets the same parser chain.

#[cfg(feature = "tree-sitter-parsing")]
pub mod python;

pub mod heuristic;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::{DocId, RelationType, SymbolKind};

/// Everything a parser may look at. Parsers must not read any other file.
pub struct ParseContext<'a> {
    pub doc_id: &'a DocId,
    pub rel_path: &'a str,
    pub ext: &'a str,
    pub content: &'a str,
    pub language_hint: Option<&'a str>,
}

/// Symbol as extracted by a parser, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSymbol {
    pub name: String,
    pub qualname: String,
    pub kind: SymbolKind,
    pub line: u32,
    pub end_line: u32,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
}

/// Relation as extracted by a parser. Targets are names; resolution to
/// documents happens later, at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRelation {
    pub from_symbol: String,
    pub to_symbol: String,
    pub rel_type: RelationType,
    pub line: u32,
}

/// Normalized parser output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    pub symbols: Vec<ParsedSymbol>,
    pub relations: Vec<ParsedRelation>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserCategory {
    /// Structured, grammar-backed parsing.
    Language,
    /// Pattern-based extraction for anything the language parsers skip.
    Heuristic,
}

/// A registered parser implementation.
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;
    fn category(&self) -> ParserCategory;
    /// Higher wins within a category; ties resolve by registration order.
    fn priority(&self) -> i32 {
        0
    }
    /// Extensions this parser bids on. Empty means it bids on everything.
    fn extensions(&self) -> &'static [&'static str];
    /// Cheap acceptance check. Must be O(small); no parsing here.
    fn can_handle(&self, _ctx: &ParseContext<'_>) -> bool {
        true
    }
    fn parse(&self, ctx: &ParseContext<'_>) -> Result<ParseOutput>;
}

struct Registered {
    parser: Arc<dyn Parser>,
    order: usize,
}

/// Ordered parser set with deterministic dispatch.
pub struct ParserRegistry {
    parsers: Vec<Registered>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self { parsers: Vec::new() }
    }

    /// The built-in parser set: the Python language parser (when compiled
    /// in) plus the generic heuristic extractor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        #[cfg(feature = "tree-sitter-parsing")]
        registry.register(Arc::new(python::PythonParser::new()));
        registry.register(Arc::new(heuristic::HeuristicParser::new()));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn Parser>) {
        let order = self.parsers.len();
        self.parsers.push(Registered { parser, order });
    }

    /// Candidate parsers for a context, in invocation order.
    pub fn candidates(&self, ctx: &ParseContext<'_>) -> Vec<Arc<dyn Parser>> {
        let mut bids: Vec<&Registered> = self
            .parsers
            .iter()
            .filter(|r| {
                let exts = r.parser.extensions();
                exts.is_empty()
                    || exts.iter().any(|e| e.eq_ignore_ascii_case(ctx.ext))
                    || ctx
                        .language_hint
                        .is_some_and(|hint| r.parser.name().eq_ignore_ascii_case(hint))
            })
            .filter(|r| r.parser.can_handle(ctx))
            .collect();
        bids.sort_by(|a, b| {
            a.parser
                .category()
                .cmp(&b.parser.category())
                .then(b.parser.priority().cmp(&a.parser.priority()))
                .then(a.order.cmp(&b.order))
        });
        bids.into_iter().map(|r| Arc::clone(&r.parser)).collect()
    }

    /// Run the candidate chain: each failure falls through to the next
    /// candidate, language parsers before heuristics. Only when every
    /// candidate fails does the file become `parse_status=failed`.
    pub fn parse(&self, ctx: &ParseContext<'_>) -> Result<(ParseOutput, &'static str)> {
        let candidates = self.candidates(ctx);
        if candidates.is_empty() {
            bail!("no parser accepts '{}'", ctx.rel_path);
        }
        let mut errors: Vec<String> = Vec::new();
        for parser in candidates {
            match parser.parse(ctx) {
                Ok(output) => return Ok((output, parser.name())),
                Err(err) => {
                    tracing::debug!(
                        parser = parser.name(),
                        path = ctx.rel_path,
                        error = %err,
                        "parser failed, trying next candidate"
                    );
                    errors.push(format!("{}: {err}", parser.name()));
                }
            }
        }
        bail!("all parsers failed for '{}': {}", ctx.rel_path, errors.join("; "))
    }
}
