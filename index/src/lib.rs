//! Structural index over TypeScript/TSX sources.
//!
//! Parses a source file into its top-level outline and addresses each
//! logical block with a stable navigational path: the first declared
//! identifier for named declarations, `$imports` for the import preamble,
//! and a self-validating `$line:<n>:<text>` fallback for everything else.
//! The same parse drives targeted block rewrites: a path plus replacement
//! text splices the block's byte range and renormalizes the surrounding
//! blank lines.
//!
//! The grammar is the TSX variant of tree-sitter-typescript, which accepts
//! plain JS, TypeScript type annotations, and JSX in one parser. Only
//! top-level program statements are addressable; nested declarations are
//! not paths.

mod outline;
mod rewrite;

use thiserror::Error;
use tree_sitter::{Node, Parser, Tree};

pub use outline::navigational_paths;
pub use rewrite::{Rewrite, block_source, replace_block};

/// Extensions the index knows how to parse.
const INDEXABLE_EXTENSIONS: [&str; 6] = ["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Whether a workspace-relative path names a source file this index can
/// outline. Everything else is addressable only as `$fullfile`.
#[must_use]
pub fn is_indexable(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| INDEXABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// The source does not parse as TSX; the file degrades to
    /// `$fullfile`-only addressing.
    #[error("source does not parse as TSX")]
    Parse,
    #[error("no top-level block matches path {0:?}")]
    UnknownPath(String),
    #[error("path {0:?} does not address a rewritable block")]
    NotRewritable(String),
}

fn parse_program(source: &str) -> Result<Tree, IndexError> {
    let mut parser = Parser::new();
    let language = tree_sitter::Language::from(tree_sitter_typescript::LANGUAGE_TSX);
    parser.set_language(&language).map_err(|err| {
        tracing::error!("Failed to load TSX grammar: {err}");
        IndexError::Parse
    })?;
    let tree = parser.parse(source, None).ok_or(IndexError::Parse)?;
    if tree.root_node().has_error() {
        return Err(IndexError::Parse);
    }
    Ok(tree)
}

/// Top-level program statements in source order, comments excluded.
fn top_level_statements<'tree>(root: Node<'tree>) -> Vec<Node<'tree>> {
    let mut nodes = Vec::with_capacity(root.named_child_count());
    for i in 0..root.named_child_count() {
        if let Some(node) = root.named_child(i)
            && node.kind() != "comment"
        {
            nodes.push(node);
        }
    }
    nodes
}

fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    &source[node.byte_range()]
}

/// The first declared identifier of a top-level declaration statement, or
/// `None` when the statement has no preferred name (then the `$line`
/// fallback applies). Named exports are transparent.
fn declaration_name(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "export_statement" => node
            .child_by_field_name("declaration")
            .and_then(|decl| declaration_name(decl, source)),
        "function_declaration"
        | "generator_function_declaration"
        | "class_declaration"
        | "abstract_class_declaration" => node
            .child_by_field_name("name")
            .map(|name| node_text(name, source).to_string()),
        "lexical_declaration" | "variable_declaration" => {
            for i in 0..node.named_child_count() {
                let Some(child) = node.named_child(i) else {
                    continue;
                };
                if child.kind() != "variable_declarator" {
                    continue;
                }
                // Destructuring patterns have no single declared name.
                return child
                    .child_by_field_name("name")
                    .filter(|name| name.kind() == "identifier")
                    .map(|name| node_text(name, source).to_string());
            }
            None
        }
        _ => None,
    }
}

fn is_import(node: Node<'_>) -> bool {
    node.kind() == "import_statement"
}

/// The source line (trimmed) on which `node` starts; used as the
/// self-validating suffix of `$line` paths.
fn line_content(source: &str, row: usize) -> String {
    source
        .lines()
        .nth(row)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}
