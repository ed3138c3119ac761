use std::collections::HashSet;

use anyhow::{anyhow, Result};
use tree_sitter::{Node, Parser, Tree};

use crate::types::{
    ChangedFunction, ClassRecord, FunctionRecord, ImportKind, ImportRecord,
};

/// Symbol tables extracted from one Python source file.
#[derive(Debug, Clone, Default)]
pub struct PyModule {
    pub functions: Vec<FunctionRecord>,
    pub classes: Vec<ClassRecord>,
    pub imports: Vec<ImportRecord>,
    pub has_errors: bool,
}

impl PyModule {
    /// Simple complexity heuristic: `functions + 2 * classes`.
    pub fn complexity_score(&self) -> usize {
        self.functions.len() + self.classes.len() * 2
    }

    /// Top-level modules referenced by imports, deduplicated.
    pub fn top_level_dependencies(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        for imp in &self.imports {
            let top = imp
                .module
                .split('.')
                .next()
                .unwrap_or(&imp.module)
                .to_string();
            if !top.is_empty() && seen.insert(top.clone()) {
                deps.push(top);
            }
        }
        deps
    }
}

fn parse(source: &str) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| anyhow!("python grammar unavailable: {e}"))?;
    parser
        .parse(source, None)
        .ok_or_else(|| anyhow!("python parse returned no tree"))
}

fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

fn visit(node: Node<'_>, f: &mut impl FnMut(Node<'_>)) {
    f(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        visit(child, f);
    }
}

/// Positional parameter names, `self` included, splats excluded.
fn parameter_names(func: Node<'_>, source: &str) -> Vec<String> {
    let Some(params) = func.child_by_field_name("parameters") else {
        return Vec::new();
    };
    let mut names = Vec::new();
    let mut cursor = params.walk();
    for child in params.named_children(&mut cursor) {
        match child.kind() {
            "identifier" => names.push(node_text(child, source).to_string()),
            "typed_parameter" | "default_parameter" | "typed_default_parameter" => {
                let mut inner = child.walk();
                if let Some(ident) = child
                    .named_children(&mut inner)
                    .find(|c| c.kind() == "identifier")
                {
                    names.push(node_text(ident, source).to_string());
                };
            }
            _ => {}
        }
    }
    names
}

/// Decorator source forms (without the leading `@`) when the definition is
/// wrapped in a `decorated_definition`.
fn decorators_of(def: Node<'_>, source: &str) -> Vec<String> {
    let Some(parent) = def.parent() else {
        return Vec::new();
    };
    if parent.kind() != "decorated_definition" {
        return Vec::new();
    }
    let mut cursor = parent.walk();
    parent
        .named_children(&mut cursor)
        .filter(|c| c.kind() == "decorator")
        .map(|c| {
            node_text(c, source)
                .trim_start_matches('@')
                .trim()
                .to_string()
        })
        .collect()
}

fn strip_py_string(text: &str) -> String {
    let trimmed = text.trim();
    // Skip string prefixes like r, b, f, rb.
    let start = trimmed
        .find(['"', '\''])
        .unwrap_or(0);
    let body = &trimmed[start..];
    let Some(quote) = body.chars().next() else {
        return String::new();
    };
    let run = if body.len() >= 6 && body.starts_with(&quote.to_string().repeat(3)) {
        3
    } else {
        1
    };
    let inner = &body[run..];
    let end = inner.len().saturating_sub(run);
    inner[..end].to_string()
}

fn docstring_of(func: Node<'_>, source: &str) -> Option<String> {
    let body = func.child_by_field_name("body")?;
    let mut cursor = body.walk();
    let first = body.named_children(&mut cursor).next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let mut inner = first.walk();
    let expr = first.named_children(&mut inner).next()?;
    if expr.kind() != "string" {
        return None;
    }
    Some(strip_py_string(node_text(expr, source)))
}

/// True when the definition sits directly in a class body (a method rather
/// than a nested function), and the class name if so.
fn enclosing_class(def: Node<'_>, source: &str) -> Option<String> {
    let mut node = def.parent()?;
    if node.kind() == "decorated_definition" {
        node = node.parent()?;
    }
    if node.kind() != "block" {
        return None;
    }
    let owner = node.parent()?;
    if owner.kind() != "class_definition" {
        return None;
    }
    owner
        .child_by_field_name("name")
        .map(|n| node_text(n, source).to_string())
}

fn collect_import(node: Node<'_>, source: &str, imports: &mut Vec<ImportRecord>) {
    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                match child.kind() {
                    "dotted_name" => imports.push(ImportRecord {
                        module: node_text(child, source).to_string(),
                        alias: None,
                        symbol: None,
                        kind: ImportKind::Plain,
                    }),
                    "aliased_import" => {
                        let mut inner = child.walk();
                        let mut named = child.named_children(&mut inner);
                        let module = named
                            .next()
                            .map(|n| node_text(n, source).to_string())
                            .unwrap_or_default();
                        let alias = named.next().map(|n| node_text(n, source).to_string());
                        imports.push(ImportRecord {
                            module,
                            alias,
                            symbol: None,
                            kind: ImportKind::Plain,
                        });
                    }
                    _ => {}
                }
            }
        }
        "import_from_statement" => {
            let module = node
                .child_by_field_name("module_name")
                .map(|n| node_text(n, source).to_string())
                .unwrap_or_default();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                // The module_name field also appears among named children.
                if Some(child) == node.child_by_field_name("module_name") {
                    continue;
                }
                match child.kind() {
                    "dotted_name" | "wildcard_import" => imports.push(ImportRecord {
                        module: module.clone(),
                        alias: None,
                        symbol: Some(node_text(child, source).to_string()),
                        kind: ImportKind::From,
                    }),
                    "aliased_import" => {
                        let mut inner = child.walk();
                        let mut named = child.named_children(&mut inner);
                        let symbol = named.next().map(|n| node_text(n, source).to_string());
                        let alias = named.next().map(|n| node_text(n, source).to_string());
                        imports.push(ImportRecord {
                            module: module.clone(),
                            alias,
                            symbol,
                            kind: ImportKind::From,
                        });
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Extract the per-file symbol tables used by the build walk.
pub fn analyze_source(source: &str) -> Result<PyModule> {
    let tree = parse(source)?;
    let root = tree.root_node();
    let mut module = PyModule {
        has_errors: root.has_error(),
        ..PyModule::default()
    };

    visit(root, &mut |node| match node.kind() {
        "function_definition" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())
                .unwrap_or_default();
            module.functions.push(FunctionRecord {
                name,
                line: node.start_position().row as u32 + 1,
                args: parameter_names(node, source),
                decorators: decorators_of(node, source),
            });
        }
        "class_definition" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())
                .unwrap_or_default();
            let bases = node
                .child_by_field_name("superclasses")
                .map(|args| {
                    let mut cursor = args.walk();
                    args.named_children(&mut cursor)
                        .map(|c| node_text(c, source).to_string())
                        .collect()
                })
                .unwrap_or_default();
            let methods = node
                .child_by_field_name("body")
                .map(|body| {
                    let mut cursor = body.walk();
                    body.named_children(&mut cursor)
                        .filter_map(|child| {
                            let def = if child.kind() == "decorated_definition" {
                                child.child_by_field_name("definition")?
                            } else {
                                child
                            };
                            if def.kind() == "function_definition" {
                                def.child_by_field_name("name")
                                    .map(|n| node_text(n, source).to_string())
                            } else {
                                None
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();
            module.classes.push(ClassRecord {
                name,
                line: node.start_position().row as u32 + 1,
                bases,
                methods,
            });
        }
        _ => collect_import(node, source, &mut module.imports),
    });

    Ok(module)
}

/// Every function definition whose inclusive line span intersects
/// `changed_lines`, with its source slice and context, for Phase 1 of the
/// test stage.
pub fn changed_functions(
    filename: &str,
    source: &str,
    changed_lines: &HashSet<u32>,
) -> Result<Vec<ChangedFunction>> {
    let tree = parse(source)?;
    if tree.root_node().has_error() {
        return Err(anyhow!("syntax error in {filename}"));
    }
    let lines: Vec<&str> = source.split('\n').collect();
    let mut found = Vec::new();

    visit(tree.root_node(), &mut |node| {
        if node.kind() != "function_definition" {
            return;
        }
        let start = node.start_position().row as u32 + 1;
        let end = node.end_position().row as u32 + 1;
        if !changed_lines.iter().any(|l| *l >= start && *l <= end) {
            return;
        }
        let name = node
            .child_by_field_name("name")
            .map(|n| node_text(n, source).to_string())
            .unwrap_or_default();
        let slice = lines
            .get(start as usize - 1..end as usize)
            .unwrap_or_default()
            .join("\n");
        let class_name = enclosing_class(node, source);
        found.push(ChangedFunction {
            filename: filename.to_string(),
            function_name: name,
            start_line: start,
            end_line: end,
            source: slice,
            is_class_method: class_name.is_some(),
            class_name,
            decorators: decorators_of(node, source),
            docstring: docstring_of(node, source),
        });
    });

    Ok(found)
}
