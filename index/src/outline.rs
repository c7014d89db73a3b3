//! Top-level outline: one navigational path per program statement.

use std::collections::HashSet;

use atelier_types::BlockPath;

use crate::{
    IndexError, declaration_name, is_import, line_content, parse_program, top_level_statements,
};

/// Emit the navigational paths of `source` in source order.
///
/// Contiguous (and even scattered) top-level imports collapse into a single
/// `$imports` path at the position of the first one. Named declarations —
/// including those wrapped in a named export — emit their first declared
/// identifier. Everything else emits the `$line:<n>:<trimmed-line>`
/// fallback. Duplicates keep the first occurrence.
pub fn navigational_paths(source: &str) -> Result<Vec<BlockPath>, IndexError> {
    let tree = parse_program(source)?;
    let root = tree.root_node();

    let mut paths = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut imports_emitted = false;

    for node in top_level_statements(root) {
        if is_import(node) {
            if !imports_emitted {
                paths.push(BlockPath::Imports);
                imports_emitted = true;
            }
            continue;
        }

        let path = match declaration_name(node, source) {
            Some(name) => BlockPath::Named(name),
            None => BlockPath::Line {
                line: node.start_position().row + 1,
                content: line_content(source, node.start_position().row),
            },
        };

        if seen.insert(path.to_string()) {
            paths.push(path);
        } else {
            tracing::warn!(path = %path, "Duplicate top-level declaration; keeping first");
        }
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(source: &str) -> Vec<String> {
        navigational_paths(source)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn named_declarations_emit_identifiers() {
        let source = "\
function greet() { return 1; }
class Widget {}
const limit = 10;
let cursor = 0;
var legacy = true;
";
        assert_eq!(paths(source), ["greet", "Widget", "limit", "cursor", "legacy"]);
    }

    #[test]
    fn exported_declarations_are_transparent() {
        let source = "\
export function greet() { return \"hi\"; }
export const X = 1;
export default class App {}
";
        assert_eq!(paths(source), ["greet", "X", "App"]);
    }

    #[test]
    fn contiguous_imports_collapse_to_one_path() {
        let source = "\
import a from \"a\";
import b from \"b\";
const v = 0;
";
        assert_eq!(paths(source), ["$imports", "v"]);
    }

    #[test]
    fn unnamed_statements_fall_back_to_line_paths() {
        let source = "\
const app = 1;
console.log(\"boot\");
";
        assert_eq!(paths(source), ["app", "$line:2:console.log(\"boot\");"]);
    }

    #[test]
    fn destructured_declarations_fall_back_to_line_paths() {
        let source = "const { a, b } = load();\n";
        assert_eq!(paths(source), ["$line:1:const { a, b } = load();"]);
    }

    #[test]
    fn duplicate_identifiers_keep_first_occurrence() {
        let source = "\
var twice = 1;
var twice = 2;
";
        assert_eq!(paths(source), ["twice"]);
    }

    #[test]
    fn tsx_and_type_annotations_parse() {
        let source = "\
import React from \"react\";
export function App(props: { title: string }): React.ReactElement {
  return <h1 className=\"main\">{props.title}</h1>;
}
const count: number = 3;
";
        assert_eq!(paths(source), ["$imports", "App", "count"]);
    }

    #[test]
    fn broken_source_is_a_parse_error() {
        assert_eq!(
            navigational_paths("function {{{"),
            Err(IndexError::Parse)
        );
    }

    #[test]
    fn empty_source_has_no_paths() {
        assert_eq!(navigational_paths("").unwrap(), vec![]);
    }
}
