//! Line-level change stats for apply logging.

use similar::{ChangeTag, TextDiff};

/// Lines added/removed by one file change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub additions: u32,
    pub deletions: u32,
}

/// Count added and removed lines between two file bodies.
#[must_use]
pub fn diff_stats(old_text: &str, new_text: &str) -> DiffStats {
    let diff = TextDiff::from_lines(old_text, new_text);
    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.additions = stats.additions.saturating_add(1),
            ChangeTag::Delete => stats.deletions = stats.deletions.saturating_add(1),
            ChangeTag::Equal => {}
        }
    }
    stats
}
