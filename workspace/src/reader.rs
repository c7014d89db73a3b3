//! Ignore-aware workspace enumeration and digest assembly.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::ignore_rules::IgnoreRules;

/// First line of the digest summary; part of the prompt contract.
pub const SUMMARY_HEADER: &str = "These are the existing files in the app:";

/// One tracked file, workspace-relative with forward slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFile {
    pub path: String,
    pub text: String,
}

/// Ordered snapshot of the workspace text for one turn.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceDigest {
    files: Vec<WorkspaceFile>,
}

impl WorkspaceDigest {
    /// Build a digest from in-memory files; used by callers that already
    /// hold the text (and by tests).
    #[must_use]
    pub fn from_files(files: Vec<(String, String)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(path, text)| WorkspaceFile { path, text })
                .collect(),
        }
    }

    #[must_use]
    pub fn files(&self) -> &[WorkspaceFile] {
        &self.files
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|file| file.path == path)
            .map(|file| file.text.as_str())
    }

    /// Paths in walk order, for UI display.
    #[must_use]
    pub fn included_files(&self) -> Vec<String> {
        self.files.iter().map(|file| file.path.clone()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// The concatenated text embedded in the prompt: a fixed header line,
    /// then one `--- START OF FILE <path> ---` block per file, blank-line
    /// separated.
    #[must_use]
    pub fn summary(&self) -> String {
        let blocks: Vec<String> = self
            .files
            .iter()
            .map(|file| format_file_block(&file.path, &file.text))
            .collect();
        format!("{SUMMARY_HEADER}\n{}", blocks.join("\n\n"))
    }
}

/// One file block as it appears in the digest summary.
#[must_use]
pub fn format_file_block(path: &str, text: &str) -> String {
    format!("--- START OF FILE {path} ---\n{text}")
}

/// Enumerate tracked files under `root`: workspace-relative forward-slash
/// path plus the absolute path, in lexicographic walk order. Ignored
/// directories prune their subtree.
pub(crate) fn walk_tracked(root: &Path, rules: &IgnoreRules) -> Vec<(String, PathBuf)> {
    let filter_root = root.to_path_buf();
    let filter_rules = rules.clone();

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            match relative_path(&filter_root, entry.path()) {
                // The root itself.
                Some(rel) if rel.is_empty() => true,
                Some(rel) => !filter_rules.is_ignored(&rel),
                None => false,
            }
        })
        .build();

    let mut files = Vec::new();
    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("Workspace walk error: {err}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        if let Some(rel) = relative_path(root, entry.path()) {
            files.push((rel, entry.into_path()));
        }
    }
    files
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    Some(out)
}

/// Read the workspace into a digest.
///
/// A missing or unreadable root yields an empty digest (logged); a file
/// that fails to read is skipped without aborting the walk. Workspaces are
/// expected to be textual; non-UTF-8 files are skipped like read failures.
#[must_use]
pub fn read_workspace(root: &Path) -> WorkspaceDigest {
    if !root.is_dir() {
        tracing::error!(root = %root.display(), "Workspace root is not a readable directory");
        return WorkspaceDigest::default();
    }

    let rules = IgnoreRules::load(root);
    let mut files = Vec::new();
    for (rel, abs) in walk_tracked(root, &rules) {
        match std::fs::read_to_string(&abs) {
            Ok(text) => files.push(WorkspaceFile { path: rel, text }),
            Err(err) => {
                tracing::warn!(path = %abs.display(), "Skipping unreadable file: {err}");
            }
        }
    }
    WorkspaceDigest { files }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }

    #[test]
    fn reads_files_in_walk_order_with_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/b.ts", "b");
        write(dir.path(), "src/a.ts", "a");
        write(dir.path(), "index.html", "<html>");

        let digest = read_workspace(dir.path());
        assert_eq!(
            digest.included_files(),
            vec!["index.html", "src/a.ts", "src/b.ts"]
        );
        assert_eq!(digest.get("src/a.ts"), Some("a"));
    }

    #[test]
    fn ignored_paths_are_absent_and_directories_prune() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".aiignore", "node_modules/\n*.log\n");
        write(dir.path(), "app.ts", "code");
        write(dir.path(), "debug.log", "noise");
        write(dir.path(), "node_modules/react/index.js", "lib");

        let digest = read_workspace(dir.path());
        let files = digest.included_files();
        assert!(files.contains(&"app.ts".to_string()));
        assert!(!files.iter().any(|p| p.ends_with(".log")));
        assert!(!files.iter().any(|p| p.starts_with("node_modules")));
    }

    #[test]
    fn missing_root_yields_empty_digest() {
        let digest = read_workspace(Path::new("/definitely/not/a/real/workspace"));
        assert!(digest.is_empty());
    }

    #[test]
    fn summary_concatenates_file_blocks_under_header() {
        let digest = WorkspaceDigest::from_files(vec![
            ("a.txt".to_string(), "alpha\n".to_string()),
            ("b.txt".to_string(), "beta".to_string()),
        ]);
        let summary = digest.summary();
        assert!(summary.starts_with("These are the existing files in the app:\n"));
        assert!(summary.contains("--- START OF FILE a.txt ---\nalpha\n"));
        assert!(summary.contains("\n\n--- START OF FILE b.txt ---\nbeta"));
    }
}
