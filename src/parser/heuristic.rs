// Heuristic Parser
// Pattern-based symbol extraction for files no language parser claims.
// Catches the common declaration shapes across mainstream languages; block
// extents are approximated by indentation/brace heuristics, which is enough
// for previews and structural boost.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{ParseContext, ParseOutput, ParsedSymbol, Parser, ParserCategory};
use crate::types::SymbolKind;

static DECL_PATTERNS: Lazy<Vec<(Regex, SymbolKind)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
                .expect("valid regex"),
            SymbolKind::Function,
        ),
        (
            Regex::new(r"^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"),
            SymbolKind::Class,
        ),
        (
            Regex::new(r"^\s*(?:export\s+)?(?:async\s+)?function\s+([A-Za-z_$][A-Za-z0-9_$]*)")
                .expect("valid regex"),
            SymbolKind::Function,
        ),
        (
            Regex::new(r"^\s*(?:pub\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"),
            SymbolKind::Function,
        ),
        (
            Regex::new(r"^\s*(?:pub\s+)?struct\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"),
            SymbolKind::Struct,
        ),
        (
            Regex::new(r"^\s*(?:pub\s+)?enum\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"),
            SymbolKind::Enum,
        ),
        (
            Regex::new(r"^\s*(?:pub\s+)?trait\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"),
            SymbolKind::Interface,
        ),
        (
            Regex::new(r"^\s*(?:export\s+)?interface\s+([A-Za-z_$][A-Za-z0-9_$]*)")
                .expect("valid regex"),
            SymbolKind::Interface,
        ),
    ]
});

pub struct HeuristicParser;

impl HeuristicParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HeuristicParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for HeuristicParser {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn category(&self) -> ParserCategory {
        ParserCategory::Heuristic
    }

    fn extensions(&self) -> &'static [&'static str] {
        // Bids on everything; selection order puts it after every language
        // parser.
        &[]
    }

    fn can_handle(&self, ctx: &ParseContext<'_>) -> bool {
        !ctx.content.is_empty()
    }

    fn parse(&self, ctx: &ParseContext<'_>) -> Result<ParseOutput> {
        let lines: Vec<&str> = ctx.content.lines().collect();
        let mut matches: Vec<(u32, String, SymbolKind)> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            for (pattern, kind) in DECL_PATTERNS.iter() {
                if let Some(captures) = pattern.captures(line) {
                    if let Some(name) = captures.get(1) {
                        matches.push((idx as u32 + 1, name.as_str().to_string(), *kind));
                        break;
                    }
                }
            }
        }

        // Approximate each block as running to the line before the next
        // declaration.
        let total_lines = lines.len().max(1) as u32;
        let mut symbols = Vec::with_capacity(matches.len());
        for (i, (line, name, kind)) in matches.iter().enumerate() {
            let end_line = matches
                .get(i + 1)
                .map(|(next_line, _, _)| next_line.saturating_sub(1).max(*line))
                .unwrap_or(total_lines);
            let content: String = lines
                [(*line as usize - 1)..(end_line as usize).min(lines.len())]
                .join("\n");
            symbols.push(ParsedSymbol {
                name: name.clone(),
                qualname: name.clone(),
                kind: *kind,
                line: *line,
                end_line,
                content,
                parent_name: None,
                docstring: None,
            });
        }

        let mut output = ParseOutput {
            symbols,
            relations: Vec::new(),
            metadata: Default::default(),
        };
        output
            .metadata
            .insert("parser".to_string(), "heuristic".to_string());
        Ok(output)
    }
}
