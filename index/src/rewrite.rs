//! AST-directed block replacement.

use atelier_types::BlockPath;
use tree_sitter::Node;

use crate::{
    IndexError, declaration_name, is_import, line_content, parse_program, top_level_statements,
};

/// Result of a rewrite attempt that resolved its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    Replaced(String),
    /// The target was found but failed validation (stale `$line` content);
    /// the file is unchanged.
    Skipped { reason: String },
}

/// Replace the block addressed by `path` with `new_block`.
///
/// `$line` paths re-verify their content suffix against the live file and
/// skip on mismatch rather than rewriting the wrong statement. `$fullfile`
/// is never handled here; it signals whole-file replacement to the applier.
pub fn replace_block(
    source: &str,
    path: &BlockPath,
    new_block: &str,
) -> Result<Rewrite, IndexError> {
    let tree = parse_program(source)?;
    let statements = top_level_statements(tree.root_node());

    let (start, end) = match resolve_span(&statements, source, path)? {
        Span::Range(start, end) => (start, end),
        Span::StaleLine { expected, found } => {
            let reason = format!(
                "line content mismatch: path expects {expected:?}, file has {found:?}"
            );
            tracing::warn!(path = %path, "{reason}; leaving file unchanged");
            return Ok(Rewrite::Skipped { reason });
        }
    };

    Ok(Rewrite::Replaced(splice(source, start, end, new_block)))
}

/// The current source text of the block addressed by `path`, including any
/// attached leading comments for named blocks. `$line` paths resolve by
/// line number only — callers compare content themselves.
pub fn block_source(source: &str, path: &BlockPath) -> Result<String, IndexError> {
    let tree = parse_program(source)?;
    let statements = top_level_statements(tree.root_node());
    match resolve_span(&statements, source, path)? {
        Span::Range(start, end) => Ok(source[start..end].to_string()),
        Span::StaleLine { found, .. } => Ok(found),
    }
}

enum Span {
    Range(usize, usize),
    StaleLine { expected: String, found: String },
}

fn resolve_span(
    statements: &[Node<'_>],
    source: &str,
    path: &BlockPath,
) -> Result<Span, IndexError> {
    match path {
        BlockPath::FullFile => Err(IndexError::NotRewritable(path.to_string())),
        BlockPath::Imports => {
            let imports: Vec<&Node<'_>> =
                statements.iter().filter(|node| is_import(**node)).collect();
            let (Some(first), Some(last)) = (imports.first(), imports.last()) else {
                return Err(IndexError::UnknownPath(path.to_string()));
            };
            Ok(Span::Range(first.start_byte(), last.end_byte()))
        }
        BlockPath::Named(name) => {
            let node = statements
                .iter()
                .find(|node| declaration_name(**node, source).as_deref() == Some(name.as_str()))
                .ok_or_else(|| IndexError::UnknownPath(path.to_string()))?;
            let start = extend_over_leading_comments(*node, source);
            Ok(Span::Range(start, node.end_byte()))
        }
        BlockPath::Line { line, content } => {
            let node = statements
                .iter()
                .find(|node| node.start_position().row + 1 == *line)
                .ok_or_else(|| IndexError::UnknownPath(path.to_string()))?;
            // Validate against the same text the outline emitted: the
            // trimmed source line the statement starts on.
            let found = line_content(source, node.start_position().row);
            if found == content.trim() {
                Ok(Span::Range(node.start_byte(), node.end_byte()))
            } else {
                Ok(Span::StaleLine {
                    expected: content.trim().to_string(),
                    found,
                })
            }
        }
    }
}

/// Pull the start byte back over the contiguous comment block directly
/// above the node. A blank line breaks the attachment.
fn extend_over_leading_comments(node: Node<'_>, source: &str) -> usize {
    let mut start = node.start_byte();
    let mut current = node;
    while let Some(prev) = current.prev_sibling() {
        if prev.kind() != "comment" {
            break;
        }
        let gap = &source[prev.end_byte()..start];
        if gap.matches('\n').count() > 1 {
            break;
        }
        start = prev.start_byte();
        current = prev;
    }
    start
}

/// Cut `[start, end)` out of `source`, trim the whitespace on both sides of
/// the cut, and rejoin around the trimmed replacement with blank lines so
/// the result keeps readable spacing.
fn splice(source: &str, start: usize, end: usize, new_block: &str) -> String {
    let before = source[..start].trim_end();
    let after = source[end..].trim_start();
    let block = new_block.trim();

    let mut parts: Vec<&str> = Vec::with_capacity(3);
    if !before.is_empty() {
        parts.push(before);
    }
    if !block.is_empty() {
        parts.push(block);
    }
    if !after.is_empty() {
        parts.push(after);
    }

    let mut out = parts.join("\n\n");
    if source.ends_with('\n') && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}
