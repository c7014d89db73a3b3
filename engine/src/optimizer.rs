//! History optimization: bound prompt size by rewriting earlier turns
//! whose embedded file snapshots are still accurate.
//!
//! The walk is strictly newest-to-oldest and stops at the first message
//! whose embedded files (or applied changes) no longer match the live
//! workspace — any placeholder past that point would claim code the model
//! never saw. The placeholder strings are load-bearing signals to the
//! model ("this is unchanged from the live context"); do not reword them
//! casually.

use atelier_index::block_source;
use atelier_types::{BlockPath, ChatMessage, CodeChangeStrategy, EditKind, Role};
use atelier_workspace::WorkspaceDigest;

use crate::composer::{USER_INSTRUCTION_HEADER, advertised_paths};
use crate::envelope::{find_envelope, parse_changes};

/// Replaces an embedded file body whose content matches the live file.
pub const FILE_PLACEHOLDER: &str = "[code is identical to current context]";

/// Replaces an embedded block-path list that matches the live file.
pub const PATHS_PLACEHOLDER: &str = "[code block paths are identical to current context]";

/// Replaces a model `<changes>` envelope whose edits are all reflected in
/// the live workspace.
pub const ENVELOPE_PLACEHOLDER: &str =
    "<changes>[changes already applied; code is identical to current context]</changes>";

/// Rewrite `history` against the current workspace.
///
/// Returns the optimized copy; the walk stops at the first drift and keeps
/// everything earlier verbatim. Running the rewrite twice yields the same
/// messages.
#[must_use]
pub fn optimize_history(
    history: &[ChatMessage],
    digest: &WorkspaceDigest,
    strategy: CodeChangeStrategy,
) -> Vec<ChatMessage> {
    let mut optimized = history.to_vec();

    for message in optimized.iter_mut().rev() {
        let still_fresh = match message.role {
            Role::Model => rewrite_model_message(message, digest),
            Role::User => rewrite_user_message(message, digest, strategy),
        };
        if !still_fresh {
            break;
        }
    }

    optimized
}

/// Window the history to the last `max_turns` user turns: `-1` unbounded,
/// `0` none, otherwise the slice starting at the Nth-from-last user
/// message.
#[must_use]
pub fn window_history(history: &[ChatMessage], max_turns: i64) -> Vec<ChatMessage> {
    if max_turns < 0 {
        return history.to_vec();
    }
    if max_turns == 0 {
        return Vec::new();
    }

    let mut remaining = max_turns;
    for (index, message) in history.iter().enumerate().rev() {
        if message.role == Role::User {
            remaining -= 1;
            if remaining == 0 {
                return history[index..].to_vec();
            }
        }
    }
    history.to_vec()
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Replace a model message's envelope with the placeholder when every edit
/// in it is still reflected in the live workspace. Returns `false` (stop
/// the walk) on drift or an unverifiable envelope.
fn rewrite_model_message(message: &mut ChatMessage, digest: &WorkspaceDigest) -> bool {
    let Some((start, Some(end))) = find_envelope(&message.text) else {
        // No envelope (or a truncated one the model never finished):
        // nothing references files, keep walking.
        return true;
    };

    let Ok(edits) = parse_changes(&message.text) else {
        tracing::debug!("Unparsable envelope in history; stopping optimization walk");
        return false;
    };

    for edit in &edits {
        let matches = match edit.kind {
            EditKind::Delete => digest.get(&edit.path).is_none(),
            EditKind::Update => edit_matches_workspace(edit, digest),
        };
        if !matches {
            return false;
        }
    }

    message.text.replace_range(start..end, ENVELOPE_PLACEHOLDER);
    true
}

fn edit_matches_workspace(edit: &atelier_types::FileEdit, digest: &WorkspaceDigest) -> bool {
    let Some(current) = digest.get(&edit.path) else {
        return false;
    };
    let Some(content) = edit.content.as_deref() else {
        return false;
    };
    match edit.block_path.as_ref() {
        None | Some(BlockPath::FullFile) => normalize(current) == normalize(content),
        Some(path) => block_source(current, path)
            .is_ok_and(|live_block| normalize(&live_block) == normalize(content)),
    }
}

/// Replace a user message's embedded file bodies (and path lists) with
/// placeholders when they all match the live workspace. Returns `false`
/// on any mismatch, including a differing file set.
fn rewrite_user_message(
    message: &mut ChatMessage,
    digest: &WorkspaceDigest,
    strategy: CodeChangeStrategy,
) -> bool {
    let body = message.prompt_body().to_string();
    let mut segments = split_sections(&body);

    let referenced: Vec<&str> = segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::File { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect();
    if referenced.is_empty() {
        // A plain instruction embeds no files; keep walking.
        return true;
    }

    let mut current: Vec<&str> = digest.files().iter().map(|f| f.path.as_str()).collect();
    let mut mentioned = referenced.clone();
    current.sort_unstable();
    mentioned.sort_unstable();
    if current != mentioned {
        return false;
    }

    // Verify everything before touching anything: stop-on-drift means a
    // partial rewrite of one message would be a lie.
    for segment in &segments {
        match segment {
            Segment::Verbatim(_) => {}
            Segment::File { path, body, .. } => {
                let text = body.join("\n");
                let Some(live) = digest.get(path) else {
                    return false;
                };
                if text.trim() != FILE_PLACEHOLDER && normalize(&text) != normalize(live) {
                    return false;
                }
            }
            Segment::Paths { path, body, .. } => {
                if strategy != CodeChangeStrategy::Block {
                    continue;
                }
                let text = body.join("\n");
                let Some(live) = digest.get(path) else {
                    return false;
                };
                if text.trim() != PATHS_PLACEHOLDER
                    && text.trim() != advertised_paths(path, live)
                {
                    return false;
                }
            }
        }
    }

    for segment in &mut segments {
        match segment {
            Segment::Verbatim(_) => {}
            Segment::File { body, .. } => replace_body(body, FILE_PLACEHOLDER),
            Segment::Paths { body, .. } => {
                if strategy == CodeChangeStrategy::Block {
                    replace_body(body, PATHS_PLACEHOLDER);
                }
            }
        }
    }

    let rebuilt = rebuild(&segments);
    match message.full_text.as_mut() {
        Some(full_text) => *full_text = rebuilt,
        None => message.text = rebuilt,
    }
    true
}

fn replace_body(body: &mut Vec<String>, placeholder: &str) {
    let keep_trailing_blank = body.last().is_some_and(String::is_empty);
    body.clear();
    body.push(placeholder.to_string());
    if keep_trailing_blank {
        body.push(String::new());
    }
}

// ============================================================================
// Prompt section parsing
// ============================================================================

const FILE_MARKER_PREFIX: &str = "--- START OF FILE ";
const PATHS_MARKER_PREFIX: &str = "--- AVAILABLE CODE BLOCK PATHS for ";
const MARKER_SUFFIX: &str = " ---";

#[derive(Debug)]
enum Segment {
    Verbatim(Vec<String>),
    File {
        path: String,
        header: String,
        body: Vec<String>,
    },
    Paths {
        path: String,
        header: String,
        body: Vec<String>,
    },
}

fn marker_path<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.strip_suffix(MARKER_SUFFIX)
}

/// Split a composed prompt into verbatim runs and per-file sections, by
/// marker lines. Rebuilding an unmodified split reproduces the input.
fn split_sections(body: &str) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut current = Segment::Verbatim(Vec::new());

    for line in body.split('\n') {
        if let Some(path) = marker_path(line, FILE_MARKER_PREFIX) {
            segments.push(std::mem::replace(
                &mut current,
                Segment::File {
                    path: path.to_string(),
                    header: line.to_string(),
                    body: Vec::new(),
                },
            ));
        } else if let Some(path) = marker_path(line, PATHS_MARKER_PREFIX) {
            segments.push(std::mem::replace(
                &mut current,
                Segment::Paths {
                    path: path.to_string(),
                    header: line.to_string(),
                    body: Vec::new(),
                },
            ));
        } else if line == USER_INSTRUCTION_HEADER {
            segments.push(std::mem::replace(
                &mut current,
                Segment::Verbatim(vec![line.to_string()]),
            ));
        } else {
            match &mut current {
                Segment::Verbatim(lines) => lines.push(line.to_string()),
                Segment::File { body, .. } | Segment::Paths { body, .. } => {
                    body.push(line.to_string());
                }
            }
        }
    }
    segments.push(current);
    segments
}

fn rebuild(segments: &[Segment]) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for segment in segments {
        match segment {
            Segment::Verbatim(own) => lines.extend(own.iter().map(String::as_str)),
            Segment::File { header, body, .. } | Segment::Paths { header, body, .. } => {
                lines.push(header);
                lines.extend(body.iter().map(String::as_str));
            }
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use atelier_types::CodeChangeStrategy;

    use super::*;
    use crate::composer::compose_prompt;

    fn digest_with(text: &str) -> WorkspaceDigest {
        WorkspaceDigest::from_files(vec![("src/a.ts".to_string(), text.to_string())])
    }

    fn user_turn(digest: &WorkspaceDigest, instruction: &str) -> ChatMessage {
        let composed = compose_prompt(digest, CodeChangeStrategy::Full, instruction);
        ChatMessage::user_with_prompt(instruction, composed.prompt)
    }

    #[test]
    fn split_and_rebuild_round_trips() {
        let digest = digest_with("const a = 1;\n");
        let composed = compose_prompt(&digest, CodeChangeStrategy::Block, "tweak");
        let segments = split_sections(&composed.prompt);
        assert_eq!(rebuild(&segments), composed.prompt);
    }

    #[test]
    fn matching_user_turns_collapse_to_placeholders() {
        let digest = digest_with("const a = 1;\n");
        let history = vec![user_turn(&digest, "do the thing")];

        let optimized = optimize_history(&history, &digest, CodeChangeStrategy::Full);

        let body = optimized[0].prompt_body();
        assert!(body.contains(FILE_PLACEHOLDER));
        assert!(!body.contains("const a = 1;"));
        // The instruction and markers survive.
        assert!(body.contains("--- START OF FILE src/a.ts ---"));
        assert!(body.contains("---User Instruction---\ndo the thing"));
    }

    #[test]
    fn walk_stops_at_first_drift() {
        let old_digest = digest_with("const a = 0;\n");
        let digest = digest_with("const a = 1;\n");

        // Oldest turn saw different code; the two newer ones saw current.
        let history = vec![
            user_turn(&old_digest, "first"),
            user_turn(&digest, "second"),
            user_turn(&digest, "third"),
        ];

        let optimized = optimize_history(&history, &digest, CodeChangeStrategy::Full);

        assert!(optimized[2].prompt_body().contains(FILE_PLACEHOLDER));
        assert!(optimized[1].prompt_body().contains(FILE_PLACEHOLDER));
        // Untouched, still carries the stale code verbatim.
        assert!(optimized[0].prompt_body().contains("const a = 0;"));
        assert!(!optimized[0].prompt_body().contains(FILE_PLACEHOLDER));
    }

    #[test]
    fn drift_in_a_newer_turn_shields_older_matching_turns() {
        let digest = digest_with("const a = 1;\n");
        let stale = digest_with("const a = 2;\n");

        let history = vec![user_turn(&digest, "older"), user_turn(&stale, "newest")];
        let optimized = optimize_history(&history, &digest, CodeChangeStrategy::Full);

        // The newest drifted, so the older matching turn is kept verbatim.
        assert_eq!(optimized[0], history[0]);
        assert_eq!(optimized[1], history[1]);
    }

    #[test]
    fn differing_file_set_is_a_drift() {
        let digest = digest_with("const a = 1;\n");
        let wider = WorkspaceDigest::from_files(vec![
            ("src/a.ts".to_string(), "const a = 1;\n".to_string()),
            ("src/b.ts".to_string(), "const b = 2;\n".to_string()),
        ]);

        let history = vec![user_turn(&digest, "hi")];
        let optimized = optimize_history(&history, &wider, CodeChangeStrategy::Full);
        assert_eq!(optimized[0], history[0]);
    }

    #[test]
    fn optimization_is_idempotent() {
        let digest = digest_with("const a = 1;\n");
        let history = vec![
            user_turn(&digest, "one"),
            ChatMessage::model(
                "Applying.\n<changes><change type=\"update\"><file>src/a.ts</file>\
                 <content><![CDATA[const a = 1;\n]]></content></change></changes>",
            ),
            user_turn(&digest, "two"),
        ];

        let once = optimize_history(&history, &digest, CodeChangeStrategy::Full);
        let twice = optimize_history(&once, &digest, CodeChangeStrategy::Full);
        assert_eq!(once, twice);
        assert!(once[1].text.contains(ENVELOPE_PLACEHOLDER));
    }

    #[test]
    fn model_envelope_with_drifted_content_stops_the_walk() {
        let digest = digest_with("const a = 1;\n");
        let history = vec![
            user_turn(&digest, "older"),
            ChatMessage::model(
                "<changes><change type=\"update\"><file>src/a.ts</file>\
                 <content><![CDATA[const a = 999;\n]]></content></change></changes>",
            ),
        ];

        let optimized = optimize_history(&history, &digest, CodeChangeStrategy::Full);
        assert_eq!(optimized, history);
    }

    #[test]
    fn model_message_without_envelope_keeps_walking() {
        let digest = digest_with("const a = 1;\n");
        let history = vec![user_turn(&digest, "q"), ChatMessage::model("Sure, what next?")];

        let optimized = optimize_history(&history, &digest, CodeChangeStrategy::Full);
        assert!(optimized[0].prompt_body().contains(FILE_PLACEHOLDER));
        assert_eq!(optimized[1], history[1]);
    }

    #[test]
    fn block_strategy_compares_path_lists_too() {
        let digest = digest_with("export function greet() {}\n");
        let composed = compose_prompt(&digest, CodeChangeStrategy::Block, "go");
        let history = vec![ChatMessage::user_with_prompt("go", composed.prompt)];

        let optimized = optimize_history(&history, &digest, CodeChangeStrategy::Block);
        let body = optimized[0].prompt_body();
        assert!(body.contains(FILE_PLACEHOLDER));
        assert!(body.contains(PATHS_PLACEHOLDER));

        // Same file body, tampered path list: the paths comparison drifts.
        let composed = compose_prompt(&digest, CodeChangeStrategy::Block, "go");
        let tampered = composed.prompt.replace("---\ngreet", "---\nhello");
        let history = vec![ChatMessage::user_with_prompt("go", tampered)];
        let optimized = optimize_history(&history, &digest, CodeChangeStrategy::Block);
        assert_eq!(optimized[0].prompt_body(), history[0].prompt_body());
    }

    #[test]
    fn windowing_keeps_the_last_n_user_turns() {
        let history = vec![
            ChatMessage::user("u1"),
            ChatMessage::model("m1"),
            ChatMessage::user("u2"),
            ChatMessage::model("m2"),
            ChatMessage::user("u3"),
            ChatMessage::model("m3"),
        ];

        let windowed = window_history(&history, 2);
        assert_eq!(windowed.len(), 4);
        assert_eq!(windowed[0].text, "u2");

        assert_eq!(window_history(&history, -1).len(), 6);
        assert!(window_history(&history, 0).is_empty());
        assert_eq!(window_history(&history, 99).len(), 6);
    }
}
