// Python Language Parser
// Tree-sitter based symbol and relation extraction for Python sources: defs,
// classes, methods, module-level assignments, docstrings, call edges,
// imports, and inheritance. The reference language parser; other grammars
// plug in beside it through the registry.

use anyhow::{anyhow, Context as _, Result};
use tree_sitter::Node;

use super::{ParseContext, ParseOutput, ParsedRelation, ParsedSymbol, Parser, ParserCategory};
use crate::types::{RelationType, SymbolKind};

const FUNCTION_DEFINITION: &str = "function_definition";
const CLASS_DEFINITION: &str = "class_definition";
const DECORATED_DEFINITION: &str = "decorated_definition";
const IMPORT_STATEMENT: &str = "import_statement";
const IMPORT_FROM_STATEMENT: &str = "import_from_statement";
const EXPRESSION_STATEMENT: &str = "expression_statement";
const ASSIGNMENT: &str = "assignment";
const CALL: &str = "call";
const STRING: &str = "string";

pub struct PythonParser;

impl PythonParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PythonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for PythonParser {
    fn name(&self) -> &'static str {
        "python"
    }

    fn category(&self) -> ParserCategory {
        ParserCategory::Language
    }

    fn priority(&self) -> i32 {
        10
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn parse(&self, ctx: &ParseContext<'_>) -> Result<ParseOutput> {
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .context("failed to load python grammar")?;
        let tree = parser
            .parse(ctx.content, None)
            .ok_or_else(|| anyhow!("tree-sitter returned no tree for '{}'", ctx.rel_path))?;

        let module_name = ctx
            .rel_path
            .rsplit('/')
            .next()
            .and_then(|f| f.strip_suffix(".py").or_else(|| f.strip_suffix(".pyi")))
            .unwrap_or("module")
            .to_string();

        let mut extractor = Extractor {
            source: ctx.content,
            module_name,
            scope: Vec::new(),
            output: ParseOutput::default(),
        };
        extractor.visit(tree.root_node());
        extractor
            .output
            .metadata
            .insert("parser".to_string(), "python".to_string());
        Ok(extractor.output)
    }
}

struct Extractor<'a> {
    source: &'a str,
    module_name: String,
    /// Enclosing symbol names, innermost last.
    scope: Vec<(String, SymbolKind)>,
    output: ParseOutput,
}

impl<'a> Extractor<'a> {
    fn text(&self, node: Node<'_>) -> &'a str {
        &self.source[node.byte_range()]
    }

    fn qualname(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            let mut parts: Vec<&str> = self.scope.iter().map(|(n, _)| n.as_str()).collect();
            parts.push(name);
            parts.join(".")
        }
    }

    fn current_symbol(&self) -> String {
        self.scope
            .last()
            .map(|(n, _)| n.clone())
            .unwrap_or_else(|| self.module_name.clone())
    }

    /// Single-pass traversal: every node is visited exactly once, so each
    /// call site yields exactly one edge.
    fn visit(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            match child.kind() {
                FUNCTION_DEFINITION => self.visit_function(child),
                CLASS_DEFINITION => self.visit_class(child),
                DECORATED_DEFINITION => {
                    if let Some(definition) = child.child_by_field_name("definition") {
                        match definition.kind() {
                            FUNCTION_DEFINITION => self.visit_function(definition),
                            CLASS_DEFINITION => self.visit_class(definition),
                            _ => {}
                        }
                    }
                }
                IMPORT_STATEMENT | IMPORT_FROM_STATEMENT => self.visit_import(child),
                CALL => {
                    self.record_call(child);
                    // Arguments may carry nested calls.
                    self.visit(child);
                }
                EXPRESSION_STATEMENT => {
                    if self.scope.is_empty() {
                        self.visit_module_assignment(child);
                    }
                    self.visit(child);
                }
                STRING | "comment" => {}
                _ => self.visit(child),
            }
        }
    }

    fn visit_function(&mut self, node: Node<'_>) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        let inside_class = matches!(self.scope.last(), Some((_, SymbolKind::Class)));
        let kind = if inside_class {
            SymbolKind::Method
        } else {
            SymbolKind::Function
        };

        self.push_symbol(node, &name, kind);
        self.scope.push((name, kind));
        if let Some(body) = node.child_by_field_name("body") {
            self.visit(body);
        }
        self.scope.pop();
    }

    fn visit_class(&mut self, node: Node<'_>) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        self.push_symbol(node, &name, SymbolKind::Class);

        // Base classes become inheritance edges.
        if let Some(superclasses) = node.child_by_field_name("superclasses") {
            let mut cursor = superclasses.walk();
            for base in superclasses.named_children(&mut cursor) {
                if let Some(base_name) = rightmost_identifier(base, self.source) {
                    self.output.relations.push(ParsedRelation {
                        from_symbol: name.clone(),
                        to_symbol: base_name,
                        rel_type: RelationType::Inherits,
                        line: node.start_position().row as u32 + 1,
                    });
                }
            }
        }

        self.scope.push((name, SymbolKind::Class));
        if let Some(body) = node.child_by_field_name("body") {
            self.visit(body);
        }
        self.scope.pop();
    }

    fn visit_import(&mut self, node: Node<'_>) {
        let line = node.start_position().row as u32 + 1;
        let from = self.current_symbol();
        if node.kind() == IMPORT_FROM_STATEMENT {
            if let Some(module) = node.child_by_field_name("module_name") {
                self.output.relations.push(ParsedRelation {
                    from_symbol: from,
                    to_symbol: self.text(module).to_string(),
                    rel_type: RelationType::Imports,
                    line,
                });
            }
            return;
        }
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if matches!(child.kind(), "dotted_name" | "aliased_import") {
                let target = match child.kind() {
                    "aliased_import" => child
                        .child_by_field_name("name")
                        .map(|n| self.text(n).to_string()),
                    _ => Some(self.text(child).to_string()),
                };
                if let Some(target) = target {
                    self.output.relations.push(ParsedRelation {
                        from_symbol: from.clone(),
                        to_symbol: target,
                        rel_type: RelationType::Imports,
                        line,
                    });
                }
            }
        }
    }

    fn visit_module_assignment(&mut self, statement: Node<'_>) {
        let mut cursor = statement.walk();
        for child in statement.named_children(&mut cursor) {
            if child.kind() != ASSIGNMENT {
                continue;
            }
            let Some(left) = child.child_by_field_name("left") else {
                continue;
            };
            if left.kind() == "identifier" {
                let name = self.text(left).to_string();
                // Dunder assignments are module metadata, not symbols.
                if name.starts_with("__") && name.ends_with("__") {
                    continue;
                }
                self.push_symbol(child, &name, SymbolKind::Variable);
            }
        }
    }

    /// Record one call edge from the current scope to a named callee.
    fn record_call(&mut self, node: Node<'_>) {
        if let Some(function) = node.child_by_field_name("function") {
            if let Some(callee) = rightmost_identifier(function, self.source) {
                self.output.relations.push(ParsedRelation {
                    from_symbol: self.current_symbol(),
                    to_symbol: callee,
                    rel_type: RelationType::Calls,
                    line: node.start_position().row as u32 + 1,
                });
            }
        }
    }

    fn push_symbol(&mut self, node: Node<'_>, name: &str, kind: SymbolKind) {
        let docstring = match kind {
            SymbolKind::Function | SymbolKind::Method | SymbolKind::Class => {
                extract_docstring(node, self.source)
            }
            _ => None,
        };
        self.output.symbols.push(ParsedSymbol {
            name: name.to_string(),
            qualname: self.qualname(name),
            kind,
            line: node.start_position().row as u32 + 1,
            end_line: node.end_position().row as u32 + 1,
            content: self.text(node).to_string(),
            parent_name: self.scope.last().map(|(n, _)| n.clone()),
            docstring,
        });
    }
}

/// The rightmost identifier of a possibly dotted expression:
/// `self.repo.save` resolves to `save`.
fn rightmost_identifier(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "identifier" => Some(source[node.byte_range()].to_string()),
        "attribute" => node
            .child_by_field_name("attribute")
            .map(|n| source[n.byte_range()].to_string()),
        _ => None,
    }
}

/// First statement of a body, when it is a bare string literal.
fn extract_docstring(definition: Node<'_>, source: &str) -> Option<String> {
    let body = definition.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != EXPRESSION_STATEMENT {
        return None;
    }
    let expr = first.named_child(0)?;
    if expr.kind() != STRING {
        return None;
    }
    let raw = &source[expr.byte_range()];
    Some(
        raw.trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string(),
    )
}
