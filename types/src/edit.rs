//! Structured edits proposed by the model and the block paths that address them.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What an edit does to its target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Update,
    Delete,
}

/// A stable identifier for a top-level logical region of a source file.
///
/// Preferred forms survive whitespace-only changes: the first declared
/// identifier of a top-level function/class/variable statement, or the
/// `$imports` sentinel for the import preamble. Statements without a name
/// fall back to `$line:<n>:<trimmed-source>`, which is self-validating:
/// the content suffix must still match the live file before a rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPath {
    /// The contiguous top-level import preamble.
    Imports,
    /// Whole-file replacement; never rewritten block-wise.
    FullFile,
    /// A top-level declaration addressed by its first declared identifier.
    Named(String),
    /// Fallback for unnamed statements: 1-based line plus the trimmed
    /// source line as it appeared when the path was issued.
    Line { line: usize, content: String },
}

pub const IMPORTS_PATH: &str = "$imports";
pub const FULLFILE_PATH: &str = "$fullfile";
const LINE_PREFIX: &str = "$line:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockPathError {
    #[error("block path is empty")]
    Empty,
    #[error("malformed $line path: {0:?}")]
    MalformedLine(String),
}

impl BlockPath {
    /// Parse the wire form of a block path.
    ///
    /// Grammar: `name | "$imports" | "$fullfile" | "$line:" <decimal> ":" <text>`.
    pub fn parse(raw: &str) -> Result<Self, BlockPathError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BlockPathError::Empty);
        }
        if raw == IMPORTS_PATH {
            return Ok(Self::Imports);
        }
        if raw == FULLFILE_PATH {
            return Ok(Self::FullFile);
        }
        if let Some(rest) = raw.strip_prefix(LINE_PREFIX) {
            let Some((number, content)) = rest.split_once(':') else {
                return Err(BlockPathError::MalformedLine(raw.to_string()));
            };
            let line: usize = number
                .parse()
                .map_err(|_| BlockPathError::MalformedLine(raw.to_string()))?;
            if line == 0 {
                return Err(BlockPathError::MalformedLine(raw.to_string()));
            }
            return Ok(Self::Line {
                line,
                content: content.to_string(),
            });
        }
        Ok(Self::Named(raw.to_string()))
    }

    /// True when this path addresses a whole file rather than a block.
    #[must_use]
    pub fn is_full_file(&self) -> bool {
        matches!(self, Self::FullFile)
    }
}

impl fmt::Display for BlockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imports => f.write_str(IMPORTS_PATH),
            Self::FullFile => f.write_str(FULLFILE_PATH),
            Self::Named(name) => f.write_str(name),
            Self::Line { line, content } => write!(f, "{LINE_PREFIX}{line}:{content}"),
        }
    }
}

/// One edit record parsed from the model's `<changes>` envelope.
///
/// Invariants (enforced by the parser): a `Delete` carries neither content
/// nor a block path; an `Update` always carries content. An `Update` whose
/// block path is absent or `$fullfile` is a whole-file write; any other
/// block path triggers an AST-directed block replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdit {
    pub kind: EditKind,
    /// Workspace-relative path, forward slashes, no leading slash, no `..`.
    pub path: String,
    pub description: String,
    pub block_path: Option<BlockPath>,
    pub content: Option<String>,
}

impl FileEdit {
    #[must_use]
    pub fn update(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: EditKind::Update,
            path: path.into(),
            description: String::new(),
            block_path: None,
            content: Some(content.into()),
        }
    }

    #[must_use]
    pub fn block_update(
        path: impl Into<String>,
        block_path: BlockPath,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: EditKind::Update,
            path: path.into(),
            description: String::new(),
            block_path: Some(block_path),
            content: Some(content.into()),
        }
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: EditKind::Delete,
            path: path.into(),
            description: String::new(),
            block_path: None,
            content: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// True when this update rewrites the whole file rather than a block.
    #[must_use]
    pub fn is_whole_file(&self) -> bool {
        self.kind == EditKind::Update
            && self.block_path.as_ref().is_none_or(BlockPath::is_full_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sentinels() {
        assert_eq!(BlockPath::parse("$imports"), Ok(BlockPath::Imports));
        assert_eq!(BlockPath::parse("$fullfile"), Ok(BlockPath::FullFile));
    }

    #[test]
    fn parses_named_path() {
        assert_eq!(
            BlockPath::parse("greet"),
            Ok(BlockPath::Named("greet".to_string()))
        );
    }

    #[test]
    fn parses_line_path_with_colons_in_content() {
        let path = BlockPath::parse("$line:3:const x: number = 1;").unwrap();
        assert_eq!(
            path,
            BlockPath::Line {
                line: 3,
                content: "const x: number = 1;".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_line_paths() {
        assert!(matches!(
            BlockPath::parse("$line:abc:x"),
            Err(BlockPathError::MalformedLine(_))
        ));
        assert!(matches!(
            BlockPath::parse("$line:0:x"),
            Err(BlockPathError::MalformedLine(_))
        ));
        assert!(matches!(
            BlockPath::parse("$line:7"),
            Err(BlockPathError::MalformedLine(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        for raw in ["$imports", "$fullfile", "greet", "$line:12:return x;"] {
            let path = BlockPath::parse(raw).unwrap();
            assert_eq!(path.to_string(), raw);
            assert_eq!(BlockPath::parse(&path.to_string()).unwrap(), path);
        }
    }

    #[test]
    fn whole_file_detection() {
        assert!(FileEdit::update("a.ts", "x").is_whole_file());
        assert!(
            FileEdit::block_update("a.ts", BlockPath::FullFile, "x").is_whole_file()
        );
        assert!(
            !FileEdit::block_update("a.ts", BlockPath::Named("f".into()), "x").is_whole_file()
        );
        assert!(!FileEdit::delete("a.ts").is_whole_file());
    }
}
