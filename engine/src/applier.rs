//! Applying parsed edits to the workspace.
//!
//! Edits run in envelope order. Per-file failures are logged and do not
//! stop sibling edits; file text is cached across the batch so several
//! block edits on one file compose. The envelope itself was validated
//! before this module runs — a parse failure never reaches the applier.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use atelier_index::{Rewrite, replace_block};
use atelier_types::{EditKind, FileEdit};
use atelier_utils::{atomic_write, diff_stats};

/// What happened to each edit of a batch, by path.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl ApplyReport {
    /// True when at least one edit changed the workspace — the trigger for
    /// the post-apply snapshot.
    #[must_use]
    pub fn any_applied(&self) -> bool {
        !self.applied.is_empty()
    }
}

enum EditOutcome {
    Applied,
    Skipped(String),
}

/// Join a workspace-relative path onto `root`, rejecting anything that
/// could escape it.
fn resolve_edit_path(root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.is_empty() || relative.starts_with('/') || relative.contains('\\') {
        return None;
    }
    let mut path = root.to_path_buf();
    for segment in relative.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

/// Apply `edits` under `root`, in order.
pub async fn apply_edits(root: &Path, edits: &[FileEdit]) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut cache: HashMap<String, String> = HashMap::new();

    for edit in edits {
        match apply_one(root, edit, &mut cache).await {
            Ok(EditOutcome::Applied) => {
                tracing::info!(path = %edit.path, kind = ?edit.kind, "Edit applied");
                report.applied.push(edit.path.clone());
            }
            Ok(EditOutcome::Skipped(reason)) => {
                tracing::warn!(path = %edit.path, "Edit skipped: {reason}");
                report.skipped.push(edit.path.clone());
            }
            Err(err) => {
                tracing::error!(path = %edit.path, "Edit failed: {err:#}");
                report.failed.push(edit.path.clone());
            }
        }
    }

    report
}

async fn apply_one(
    root: &Path,
    edit: &FileEdit,
    cache: &mut HashMap<String, String>,
) -> anyhow::Result<EditOutcome> {
    let Some(target) = resolve_edit_path(root, &edit.path) else {
        bail!("refusing unsafe path {:?}", edit.path);
    };

    match edit.kind {
        EditKind::Delete => {
            if !target.exists() {
                return Ok(EditOutcome::Skipped("file does not exist".to_string()));
            }
            tokio::fs::remove_file(&target)
                .await
                .with_context(|| format!("failed to delete {}", target.display()))?;
            cache.remove(&edit.path);
            Ok(EditOutcome::Applied)
        }
        EditKind::Update if edit.is_whole_file() => {
            let content = edit.content.as_deref().unwrap_or_default();
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let previous = match cache.get(&edit.path) {
                Some(text) => Some(text.clone()),
                None => tokio::fs::read_to_string(&target).await.ok(),
            };
            atomic_write(&target, content.as_bytes())
                .with_context(|| format!("failed to write {}", target.display()))?;
            log_change(&edit.path, previous.as_deref(), content);
            cache.insert(edit.path.clone(), content.to_string());
            Ok(EditOutcome::Applied)
        }
        EditKind::Update => {
            let Some(block_path) = edit.block_path.as_ref() else {
                bail!("block update without a block path");
            };
            let content = edit.content.as_deref().unwrap_or_default();
            let text = match cache.get(&edit.path) {
                Some(text) => text.clone(),
                None => tokio::fs::read_to_string(&target)
                    .await
                    .with_context(|| format!("failed to read {}", target.display()))?,
            };

            match replace_block(&text, block_path, content)
                .with_context(|| format!("block rewrite of {} failed", edit.path))?
            {
                Rewrite::Replaced(new_text) => {
                    atomic_write(&target, new_text.as_bytes())
                        .with_context(|| format!("failed to write {}", target.display()))?;
                    log_change(&edit.path, Some(&text), &new_text);
                    cache.insert(edit.path.clone(), new_text);
                    Ok(EditOutcome::Applied)
                }
                Rewrite::Skipped { reason } => Ok(EditOutcome::Skipped(reason)),
            }
        }
    }
}

fn log_change(path: &str, previous: Option<&str>, new_text: &str) {
    let stats = diff_stats(previous.unwrap_or_default(), new_text);
    tracing::debug!(
        path,
        additions = stats.additions,
        deletions = stats.deletions,
        "Workspace file updated"
    );
}

#[cfg(test)]
mod tests {
    use std::fs;

    use atelier_types::BlockPath;

    use super::*;

    fn workspace() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn whole_file_update_creates_parents_and_overwrites() {
        let dir = workspace();
        let edits = [FileEdit::update("src/deep/new.ts", "const fresh = 1;\n")];

        let report = apply_edits(dir.path(), &edits).await;

        assert_eq!(report.applied, vec!["src/deep/new.ts"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/deep/new.ts")).unwrap(),
            "const fresh = 1;\n"
        );
    }

    #[tokio::test]
    async fn block_update_rewrites_only_the_block() {
        let dir = workspace();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/a.ts"),
            "export function greet() { return \"hi\"; }\nexport const X = 1;\n",
        )
        .unwrap();

        let edits = [FileEdit::block_update(
            "src/a.ts",
            BlockPath::Named("greet".to_string()),
            "export function greet() { return \"hello\"; }",
        )];
        let report = apply_edits(dir.path(), &edits).await;

        assert_eq!(report.applied, vec!["src/a.ts"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/a.ts")).unwrap(),
            "export function greet() { return \"hello\"; }\n\nexport const X = 1;\n"
        );
    }

    #[tokio::test]
    async fn sequential_block_edits_on_one_file_compose() {
        let dir = workspace();
        fs::write(
            dir.path().join("a.ts"),
            "import a from \"a\";\nconst v = 0;\n",
        )
        .unwrap();

        let edits = [
            FileEdit::block_update("a.ts", BlockPath::Imports, "import c from \"c\";"),
            FileEdit::block_update(
                "a.ts",
                BlockPath::Named("v".to_string()),
                "const v = 42;",
            ),
        ];
        let report = apply_edits(dir.path(), &edits).await;

        assert_eq!(report.applied.len(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.ts")).unwrap(),
            "import c from \"c\";\n\nconst v = 42;\n"
        );
    }

    #[tokio::test]
    async fn stale_line_path_skips_and_leaves_file_untouched() {
        let dir = workspace();
        fs::write(dir.path().join("a.ts"), "console.log(\"old\");\n").unwrap();

        let edits = [FileEdit::block_update(
            "a.ts",
            BlockPath::Line {
                line: 1,
                content: "console.log(\"different\")".to_string(),
            },
            "console.log(\"new\");",
        )];
        let report = apply_edits(dir.path(), &edits).await;

        assert_eq!(report.skipped, vec!["a.ts"]);
        assert!(report.applied.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("a.ts")).unwrap(),
            "console.log(\"old\");\n"
        );
    }

    #[tokio::test]
    async fn delete_removes_file_and_missing_target_is_skipped() {
        let dir = workspace();
        fs::write(dir.path().join("gone.ts"), "x").unwrap();

        let edits = [FileEdit::delete("gone.ts"), FileEdit::delete("never.ts")];
        let report = apply_edits(dir.path(), &edits).await;

        assert_eq!(report.applied, vec!["gone.ts"]);
        assert_eq!(report.skipped, vec!["never.ts"]);
        assert!(!dir.path().join("gone.ts").exists());
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_siblings() {
        let dir = workspace();
        let edits = [
            FileEdit::block_update(
                "missing.ts",
                BlockPath::Named("f".to_string()),
                "function f() {}",
            ),
            FileEdit::update("ok.ts", "const ok = true;\n"),
        ];
        let report = apply_edits(dir.path(), &edits).await;

        assert_eq!(report.failed, vec!["missing.ts"]);
        assert_eq!(report.applied, vec!["ok.ts"]);
        assert!(dir.path().join("ok.ts").exists());
    }

    #[tokio::test]
    async fn escaping_paths_are_refused() {
        let dir = workspace();
        let edits = [
            FileEdit::update("../outside.ts", "nope"),
            FileEdit::update("/absolute.ts", "nope"),
            FileEdit::update("a/../../b.ts", "nope"),
        ];
        let report = apply_edits(dir.path(), &edits).await;

        assert_eq!(report.failed.len(), 3);
        assert!(report.applied.is_empty());
    }
}
