//! Ignore-rule compilation.
//!
//! Patterns come from two optional plain-text files at the workspace root
//! and are interpreted with gitignore semantics: a leading `/` anchors to
//! the root, a pattern without `/` matches at any depth, and a trailing `/`
//! makes the pattern directory-only (matching the directory and everything
//! under it).

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Ignore files consulted at the workspace root, in order.
pub const IGNORE_FILES: [&str; 2] = [".aiignore", ".aiexclude"];

/// Compiled union of the workspace ignore patterns.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    set: Option<GlobSet>,
}

impl IgnoreRules {
    /// Load and compile the ignore files found at `root`.
    ///
    /// Missing files are fine; unreadable files and bad patterns are logged
    /// and skipped so one stray line never hides the whole workspace.
    #[must_use]
    pub fn load(root: &Path) -> Self {
        let mut lines = Vec::new();
        for name in IGNORE_FILES {
            let path = root.join(name);
            match std::fs::read_to_string(&path) {
                Ok(text) => lines.extend(parse_lines(&text)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), "Failed to read ignore file: {err}");
                }
            }
        }
        Self::from_patterns(&lines)
    }

    /// Compile already-extracted pattern lines.
    #[must_use]
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut count = 0usize;
        for pattern in patterns {
            for glob in expand_pattern(pattern.as_ref()) {
                match GlobBuilder::new(&glob).literal_separator(true).build() {
                    Ok(glob) => {
                        builder.add(glob);
                        count += 1;
                    }
                    Err(err) => {
                        tracing::warn!(pattern = %glob, "Skipping invalid ignore pattern: {err}");
                    }
                }
            }
        }
        if count == 0 {
            return Self { set: None };
        }
        match builder.build() {
            Ok(set) => Self { set: Some(set) },
            Err(err) => {
                tracing::warn!("Failed to compile ignore patterns: {err}");
                Self { set: None }
            }
        }
    }

    /// Whether a workspace-relative path (forward slashes) is ignored.
    ///
    /// A matched directory prunes its subtree: the walker consults this for
    /// every directory before descending.
    #[must_use]
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        self.set
            .as_ref()
            .is_some_and(|set| set.is_match(relative_path))
    }
}

fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}

/// Expand one ignore line into the glob(s) that implement its semantics.
fn expand_pattern(line: &str) -> Vec<String> {
    let (base, dir_only) = match line.strip_suffix('/') {
        Some(base) => (base, true),
        None => (line, false),
    };
    let base = base.strip_prefix('/').map_or_else(
        || {
            if base.contains('/') {
                // A slash anywhere anchors the pattern to the root.
                base.to_string()
            } else {
                format!("**/{base}")
            }
        },
        ToString::to_string,
    );
    if dir_only {
        vec![base.clone(), format!("{base}/**")]
    } else {
        vec![base]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unanchored_pattern_matches_at_any_depth() {
        let rules = IgnoreRules::from_patterns(&["*.log"]);
        assert!(rules.is_ignored("debug.log"));
        assert!(rules.is_ignored("src/deep/debug.log"));
        assert!(!rules.is_ignored("src/debug.rs"));
    }

    #[test]
    fn leading_slash_anchors_to_root() {
        let rules = IgnoreRules::from_patterns(&["/dist"]);
        assert!(rules.is_ignored("dist"));
        assert!(!rules.is_ignored("packages/dist"));
    }

    #[test]
    fn trailing_slash_covers_directory_and_subtree() {
        let rules = IgnoreRules::from_patterns(&["node_modules/"]);
        assert!(rules.is_ignored("node_modules"));
        assert!(rules.is_ignored("node_modules/react/index.js"));
        assert!(rules.is_ignored("vendor/node_modules"));
    }

    #[test]
    fn interior_slash_anchors_without_leading_slash() {
        let rules = IgnoreRules::from_patterns(&["src/generated"]);
        assert!(rules.is_ignored("src/generated"));
        assert!(!rules.is_ignored("other/src/generated"));
    }

    #[test]
    fn star_does_not_cross_separators() {
        let rules = IgnoreRules::from_patterns(&["/build*"]);
        assert!(rules.is_ignored("build-out"));
        assert!(!rules.is_ignored("build/nested"));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let lines = parse_lines("# comment\n\n  \n*.tmp\n");
        assert_eq!(lines, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn empty_rules_match_nothing() {
        let rules = IgnoreRules::default();
        assert!(!rules.is_ignored("anything"));
    }
}
