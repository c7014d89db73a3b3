//! Managed project workspace.
//!
//! Walks the project tree honoring the workspace ignore files, assembles the
//! per-turn digest the prompt composer embeds, and keeps labeled snapshots of
//! the tracked files in a `backups/` directory next to the workspace so every
//! destructive operation stays reversible.

pub mod ignore_rules;
pub mod reader;
pub mod snapshot;

pub use ignore_rules::IgnoreRules;
pub use reader::{WorkspaceDigest, WorkspaceFile, read_workspace};
pub use snapshot::{SnapshotError, SnapshotOutcome, SnapshotStore};
