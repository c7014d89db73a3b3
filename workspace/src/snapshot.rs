//! Labeled workspace snapshots.
//!
//! Snapshots live in a `backups/` directory next to the workspace; each one
//! is a plain subdirectory named by its label. There is no index file — the
//! directory itself is the record. Creation elides no-ops by comparing the
//! tracked file set and per-file content digests against the latest
//! snapshot; labels are timestamp-prefixed, so lexical order is
//! chronological.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ignore_rules::IgnoreRules;
use crate::reader::walk_tracked;

/// Name of the snapshot directory, a sibling of the workspace root.
pub const SNAPSHOT_DIR_NAME: &str = "backups";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0:?} does not exist")]
    Missing(String),
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Restore ran to the end but some files could not be removed or
    /// copied; the workspace may be partially restored.
    #[error("restore of {label:?} left {failures} file(s) unrestored")]
    PartialRestore { label: String, failures: usize },
}

/// Result of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Created { label: String },
    /// The tracked files byte-match the latest snapshot; nothing recorded.
    Unchanged,
}

impl SnapshotOutcome {
    #[must_use]
    pub fn created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

/// Content-addressed snapshot store for one workspace.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    workspace_root: PathBuf,
    backups_dir: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let backups_dir = workspace_root
            .parent()
            .map_or_else(|| PathBuf::from(SNAPSHOT_DIR_NAME), |p| p.join(SNAPSHOT_DIR_NAME));
        Self {
            workspace_root,
            backups_dir,
        }
    }

    #[must_use]
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    #[must_use]
    pub fn snapshot_dir(&self, label: &str) -> PathBuf {
        self.backups_dir.join(label)
    }

    /// Label of the most recent snapshot, if any.
    #[must_use]
    pub fn latest_label(&self) -> Option<String> {
        let entries = std::fs::read_dir(&self.backups_dir).ok()?;
        entries
            .flatten()
            .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .max()
    }

    /// Record a snapshot of the tracked workspace files under `label`.
    ///
    /// Unless `force` is set, an existing latest snapshot with an identical
    /// file set and identical content elides the call.
    pub fn create(&self, label: &str, force: bool) -> Result<SnapshotOutcome, SnapshotError> {
        let rules = IgnoreRules::load(&self.workspace_root);
        let files = walk_tracked(&self.workspace_root, &rules);

        if !force
            && let Some(latest) = self.latest_label()
            && self.matches_snapshot(&latest, &files)
        {
            tracing::debug!(label, latest, "Workspace unchanged; snapshot elided");
            return Ok(SnapshotOutcome::Unchanged);
        }

        let dir = self.snapshot_dir(label);
        for (rel, abs) in &files {
            let dest = dir.join(rel_to_path(rel));
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|source| SnapshotError::Io {
                    action: "create directory",
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::copy(abs, &dest).map_err(|source| SnapshotError::Io {
                action: "copy file into snapshot",
                path: abs.clone(),
                source,
            })?;
        }
        // An empty workspace still records an (empty) snapshot directory.
        std::fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            action: "create snapshot directory",
            path: dir.clone(),
            source,
        })?;

        tracing::info!(label, files = files.len(), "Snapshot recorded");
        Ok(SnapshotOutcome::Created {
            label: label.to_string(),
        })
    }

    /// Restore the workspace to the state captured in `label`.
    ///
    /// Tracked files are removed first, then the snapshot files are copied
    /// back. The two phases are not transactional: failures are logged,
    /// the rest of the restore proceeds, and a partial result is reported.
    pub fn restore(&self, label: &str) -> Result<(), SnapshotError> {
        let dir = self.snapshot_dir(label);
        if !dir.is_dir() {
            return Err(SnapshotError::Missing(label.to_string()));
        }

        let mut failures = 0usize;

        let rules = IgnoreRules::load(&self.workspace_root);
        for (_, abs) in walk_tracked(&self.workspace_root, &rules) {
            if let Err(err) = std::fs::remove_file(&abs) {
                tracing::warn!(path = %abs.display(), "Failed to remove file during restore: {err}");
                failures += 1;
            }
        }

        for (rel, abs) in collect_files(&dir) {
            let dest = self.workspace_root.join(rel_to_path(&rel));
            let copied = dest
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::copy(&abs, &dest).map(|_| ()));
            if let Err(err) = copied {
                tracing::warn!(path = %dest.display(), "Failed to restore file: {err}");
                failures += 1;
            }
        }

        if failures > 0 {
            return Err(SnapshotError::PartialRestore {
                label: label.to_string(),
                failures,
            });
        }
        tracing::info!(label, "Workspace restored from snapshot");
        Ok(())
    }

    /// Whether the current tracked files byte-match the named snapshot.
    fn matches_snapshot(&self, label: &str, current: &[(String, PathBuf)]) -> bool {
        let snapshot_files = collect_files(&self.snapshot_dir(label));

        let mut current_paths: Vec<&String> = current.iter().map(|(rel, _)| rel).collect();
        let mut snapshot_paths: Vec<&String> = snapshot_files.iter().map(|(rel, _)| rel).collect();
        current_paths.sort_unstable();
        snapshot_paths.sort_unstable();
        if current_paths != snapshot_paths {
            return false;
        }

        let Some(current_digests) = digest_all(current) else {
            return false;
        };
        let Some(snapshot_digests) = digest_all(&snapshot_files) else {
            return false;
        };
        current_digests == snapshot_digests
    }
}

fn rel_to_path(rel: &str) -> PathBuf {
    rel.split('/').collect()
}

/// Recursively list the files under `dir` as sorted (relative, absolute)
/// pairs with forward-slash relative paths.
fn collect_files(dir: &Path) -> Vec<(String, PathBuf)> {
    fn visit(base: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %dir.display(), "Failed to read snapshot directory: {err}");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                visit(base, &path, out);
            } else if let Ok(rel) = path.strip_prefix(base) {
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((rel, path));
            }
        }
    }

    let mut files = Vec::new();
    visit(dir, dir, &mut files);
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

/// SHA-256 of every file, keyed by relative path. `None` when any file
/// cannot be read — callers treat that as "not equivalent".
fn digest_all(files: &[(String, PathBuf)]) -> Option<BTreeMap<String, [u8; 32]>> {
    let mut digests = BTreeMap::new();
    for (rel, abs) in files {
        let bytes = match std::fs::read(abs) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %abs.display(), "Failed to read file for comparison: {err}");
                return None;
            }
        };
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        digests.insert(rel.clone(), hasher.finalize().into());
    }
    Some(digests)
}
