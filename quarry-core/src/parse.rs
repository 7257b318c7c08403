//! Source parsing into structural facts

use crate::document::{ChunkFact, ClassFact, FunctionFact, ImportFact, ParseError, ParsedFacts, UsageFact};
use std::path::Path;
use tree_sitter::Node;

/// A parser the indexer can hand file contents to.
pub trait SourceParser: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this parser handles `path` at all; unsupported files are not indexed.
    fn supports(&self, path: &Path) -> bool;

    fn parse(&self, path: &Path, source: &str) -> std::result::Result<ParsedFacts, ParseError>;
}

/// Python parser backed by tree-sitter-python
#[derive(Debug, Clone)]
pub struct PythonParser {
    extensions: Vec<String>,
}

impl Default for PythonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PythonParser {
    pub fn new() -> Self {
        Self::with_extensions(&["py".to_string()])
    }

    pub fn with_extensions(extensions: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }
}

impl SourceParser for PythonParser {
    fn name(&self) -> &str {
        "python"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn parse(&self, _path: &Path, source: &str) -> std::result::Result<ParsedFacts, ParseError> {
        let mut parser = tree_sitter::Parser::new();
        let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
        parser.set_language(&language).map_err(|e| ParseError {
            line: 0,
            message: format!("grammar unavailable: {e}"),
        })?;

        let tree = parser.parse(source, None).ok_or_else(|| ParseError {
            line: 0,
            message: "parser produced no tree".to_string(),
        })?;

        let root = tree.root_node();
        if root.has_error() {
            return Err(locate_syntax_error(root, source));
        }

        let mut extractor = Extractor {
            source,
            facts: ParsedFacts {
                lines: source.lines().count(),
                ..Default::default()
            },
        };
        if let Some(doc) = docstring_of(root, source) {
            extractor.facts.chunks.push(ChunkFact {
                chunk_type: "docstring".to_string(),
                text: doc,
                line: 1,
            });
        }
        extractor.visit(root, Scope::Module);
        Ok(extractor.facts)
    }
}

/// Where a definition sits, which decides whether it is a function or a method
#[derive(Debug, Clone, Copy)]
enum Scope {
    Module,
    Class(usize),
    Nested,
}

struct Extractor<'s> {
    source: &'s str,
    facts: ParsedFacts,
}

impl Extractor<'_> {
    fn visit(&mut self, node: Node<'_>, scope: Scope) {
        match node.kind() {
            "class_definition" => {
                let index = self.push_class(node, matches!(scope, Scope::Module));
                if let Some(body) = node.child_by_field_name("body") {
                    for child in named_children(body) {
                        self.visit(child, Scope::Class(index));
                    }
                }
                if let Some(bases) = node.child_by_field_name("superclasses") {
                    self.visit(bases, Scope::Nested);
                }
                return;
            }
            "function_definition" => {
                let fact = self.function_fact(node);
                match scope {
                    Scope::Module => {
                        self.push_docstring_chunk(&fact.docstring, fact.line);
                        self.facts.chunks.push(ChunkFact {
                            chunk_type: "code".to_string(),
                            text: node_text(node, self.source),
                            line: fact.line,
                        });
                        self.facts.functions.push(fact);
                    }
                    Scope::Class(index) => {
                        self.push_docstring_chunk(&fact.docstring, fact.line);
                        self.facts.classes[index].methods.push(fact);
                    }
                    Scope::Nested => {}
                }
                for child in named_children(node) {
                    self.visit(child, Scope::Nested);
                }
                return;
            }
            "import_statement" => self.push_imports(node, None, "import"),
            "import_from_statement" => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(|m| node_text(m, self.source));
                self.push_imports(node, module, "from");
            }
            "future_import_statement" => {
                self.push_imports(node, Some("__future__".to_string()), "from");
            }
            "call" => self.push_usage(node),
            _ => {}
        }

        let child_scope = match node.kind() {
            "module" | "block" | "decorated_definition" => scope,
            _ => Scope::Nested,
        };
        for child in named_children(node) {
            self.visit(child, child_scope);
        }
    }

    fn push_class(&mut self, node: Node<'_>, top_level: bool) -> usize {
        let name = field_text(node, "name", self.source).unwrap_or_default();
        let bases = node
            .child_by_field_name("superclasses")
            .map(|list| {
                named_children(list)
                    .into_iter()
                    .map(|b| node_text(b, self.source))
                    .collect()
            })
            .unwrap_or_default();
        let docstring = node
            .child_by_field_name("body")
            .and_then(|body| docstring_of(body, self.source));
        let line = node.start_position().row + 1;

        self.push_docstring_chunk(&docstring, line);
        if top_level {
            self.facts.chunks.push(ChunkFact {
                chunk_type: "code".to_string(),
                text: node_text(node, self.source),
                line,
            });
        }
        self.facts.classes.push(ClassFact {
            name,
            line,
            end_line: node.end_position().row + 1,
            docstring,
            bases,
            methods: Vec::new(),
        });
        self.facts.classes.len() - 1
    }

    fn function_fact(&self, node: Node<'_>) -> FunctionFact {
        let is_async = node.child(0).map(|c| c.kind() == "async").unwrap_or(false);
        let args = node
            .child_by_field_name("parameters")
            .map(|p| parameter_names(p, self.source))
            .unwrap_or_default();
        let body = node.child_by_field_name("body");
        FunctionFact {
            name: field_text(node, "name", self.source).unwrap_or_default(),
            line: node.start_position().row + 1,
            end_line: node.end_position().row + 1,
            docstring: body.and_then(|b| docstring_of(b, self.source)),
            args,
            complexity: 1 + body.map(decision_points).unwrap_or(0),
            is_async,
        }
    }

    fn push_imports(&mut self, node: Node<'_>, module: Option<String>, import_type: &str) {
        let line = node.start_position().row + 1;
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name_node in names {
            let name = match name_node.kind() {
                "aliased_import" => field_text(name_node, "name", self.source).unwrap_or_default(),
                _ => node_text(name_node, self.source),
            };
            if !name.is_empty() {
                self.facts.imports.push(ImportFact {
                    name,
                    module: module.clone(),
                    import_type: import_type.to_string(),
                    line,
                });
            }
        }
        if named_children(node).iter().any(|c| c.kind() == "wildcard_import") {
            self.facts.imports.push(ImportFact {
                name: "*".to_string(),
                module,
                import_type: import_type.to_string(),
                line,
            });
        }
    }

    fn push_usage(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let (name, usage_type) = match function.kind() {
            "identifier" => (node_text(function, self.source), "call"),
            "attribute" => (
                field_text(function, "attribute", self.source).unwrap_or_default(),
                "attribute_call",
            ),
            _ => (node_text(function, self.source), "call"),
        };
        if !name.is_empty() {
            self.facts.usages.push(UsageFact {
                name,
                usage_type: usage_type.to_string(),
                line: node.start_position().row + 1,
            });
        }
    }

    fn push_docstring_chunk(&mut self, docstring: &Option<String>, line: usize) {
        if let Some(text) = docstring.as_ref().filter(|d| !d.is_empty()) {
            self.facts.chunks.push(ChunkFact {
                chunk_type: "docstring".to_string(),
                text: text.clone(),
                line,
            });
        }
    }
}

fn parameter_names(params: Node<'_>, source: &str) -> Vec<String> {
    named_children(params)
        .into_iter()
        .filter_map(|param| match param.kind() {
            "identifier" => Some(node_text(param, source)),
            "default_parameter" | "typed_default_parameter" => field_text(param, "name", source),
            "typed_parameter" => param.named_child(0).map(|n| node_text(n, source)),
            "list_splat_pattern" | "dictionary_splat_pattern" => Some(node_text(param, source)),
            _ => None,
        })
        .collect()
}

/// Branching constructs below `node`, not descending into nested definitions.
fn decision_points(node: Node<'_>) -> usize {
    named_children(node)
        .into_iter()
        .map(|child| match child.kind() {
            "function_definition" | "class_definition" => 0,
            "if_statement" | "elif_clause" | "for_statement" | "while_statement"
            | "except_clause" | "boolean_operator" | "conditional_expression"
            | "for_in_clause" | "if_clause" | "case_clause" => 1 + decision_points(child),
            _ => decision_points(child),
        })
        .sum()
}

/// Docstring of a module or block: a leading string expression statement.
fn docstring_of(container: Node<'_>, source: &str) -> Option<String> {
    let first = container.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = first.named_child(0)?;
    if string.kind() != "string" {
        return None;
    }
    Some(clean_docstring(&node_text(string, source)))
}

fn clean_docstring(raw: &str) -> String {
    let unprefixed = raw.trim_start_matches(|c: char| "rRbBuUfF".contains(c));
    let body = ["\"\"\"", "'''", "\"", "'"]
        .iter()
        .find_map(|quote| {
            unprefixed
                .strip_prefix(quote)
                .and_then(|s| s.strip_suffix(quote))
        })
        .unwrap_or(unprefixed);
    body.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn locate_syntax_error(root: Node<'_>, source: &str) -> ParseError {
    match first_error_node(root) {
        Some(node) if node.is_missing() => ParseError {
            line: node.start_position().row + 1,
            message: format!("missing `{}`", node.kind()),
        },
        Some(node) => {
            let snippet: String = node_text(node, source)
                .lines()
                .next()
                .unwrap_or_default()
                .chars()
                .take(40)
                .collect();
            ParseError {
                line: node.start_position().row + 1,
                message: format!("invalid syntax near `{snippet}`"),
            }
        }
        None => ParseError {
            line: 1,
            message: "invalid syntax".to_string(),
        },
    }
}

fn first_error_node(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            if let Some(found) = first_error_node(child) {
                return Some(found);
            }
        }
    }
    None
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

fn field_text(node: Node<'_>, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field).map(|n| node_text(n, source))
}

fn node_text(node: Node<'_>, source: &str) -> String {
    source[node.start_byte()..node.end_byte()].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#""""Module docs."""
import os, sys as system
from collections import OrderedDict, defaultdict as dd
from pkg import *


class Shape(Base, Mixin):
    """A shape."""

    def __init__(self, name, *args, size=1, **kwargs):
        self.name = name
        os.path.join(name, "x")

    @property
    def label(self):
        if self.name and self.size:
            return self.name
        return "none"

    async def load(self):
        await fetch(self.name)


def helper(a: int, b=2):
    """Help."""
    def inner():
        pass
    return compute(a) if a else b


async def main():
    helper(1)
"#;

    fn parse(source: &str) -> std::result::Result<ParsedFacts, ParseError> {
        PythonParser::new().parse(Path::new("sample.py"), source)
    }

    #[test]
    fn extracts_classes_methods_and_functions() {
        let facts = parse(SAMPLE).unwrap();

        assert_eq!(facts.classes.len(), 1);
        let shape = &facts.classes[0];
        assert_eq!(shape.name, "Shape");
        assert_eq!(shape.bases, vec!["Base", "Mixin"]);
        assert_eq!(shape.docstring.as_deref(), Some("A shape."));

        let methods: Vec<&str> = shape.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(methods, vec!["__init__", "label", "load"]);
        assert_eq!(shape.methods[0].args, vec!["self", "name", "*args", "size", "**kwargs"]);
        assert!(shape.methods[2].is_async);
        assert_eq!(shape.methods[1].complexity, 3);

        let functions: Vec<&str> = facts.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(functions, vec!["helper", "main"]);
        assert_eq!(facts.functions[0].args, vec!["a", "b"]);
        assert_eq!(facts.functions[0].complexity, 2);
        assert!(facts.functions[1].is_async);
        assert_eq!(facts.method_count(), 3);
    }

    #[test]
    fn one_import_row_per_name() {
        let facts = parse(SAMPLE).unwrap();
        let names: Vec<(&str, Option<&str>, &str)> = facts
            .imports
            .iter()
            .map(|i| (i.name.as_str(), i.module.as_deref(), i.import_type.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("os", None, "import"),
                ("sys", None, "import"),
                ("OrderedDict", Some("collections"), "from"),
                ("defaultdict", Some("collections"), "from"),
                ("*", Some("pkg"), "from"),
            ]
        );
    }

    #[test]
    fn usages_are_call_sites() {
        let facts = parse(SAMPLE).unwrap();
        let calls: Vec<&str> = facts.usages.iter().map(|u| u.name.as_str()).collect();
        assert!(calls.contains(&"join"));
        assert!(calls.contains(&"fetch"));
        assert!(calls.contains(&"compute"));
        assert!(calls.contains(&"helper"));
        assert!(!calls.contains(&"property"));
    }

    #[test]
    fn chunks_cover_docstrings_and_top_level_code() {
        let facts = parse(SAMPLE).unwrap();
        let docstrings: Vec<&str> = facts
            .chunks
            .iter()
            .filter(|c| c.chunk_type == "docstring")
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(docstrings, vec!["Module docs.", "A shape.", "Help."]);
        let code = facts.chunks.iter().filter(|c| c.chunk_type == "code").count();
        assert_eq!(code, 3);
    }

    #[test]
    fn syntax_error_reports_line() {
        let err = parse("x = 1\n\ndef broken(:\n    pass\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(!err.message.is_empty());
    }

    #[test]
    fn supports_configured_extensions_only() {
        let parser = PythonParser::with_extensions(&[".py".to_string(), "pyi".to_string()]);
        assert!(parser.supports(Path::new("a/b.py")));
        assert!(parser.supports(Path::new("stubs.PYI")));
        assert!(!parser.supports(Path::new("README.md")));
    }
}
