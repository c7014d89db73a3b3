//! Prompt composition.
//!
//! One composed prompt per turn: the workspace digest, the per-file block
//! path sections when the block strategy is active, and the user
//! instruction under its fixed header. The section markers here are part of
//! the prompt contract — the history optimizer parses them back out of
//! prior turns.

use atelier_index::navigational_paths;
use atelier_types::{CodeChangeStrategy, edit::FULLFILE_PATH};
use atelier_workspace::WorkspaceDigest;

/// Header introducing the user's instruction at the end of the prompt.
pub const USER_INSTRUCTION_HEADER: &str = "---User Instruction---";

/// The composed prompt plus the file list for UI display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub included_files: Vec<String>,
}

/// Marker line introducing one file's available block paths.
#[must_use]
pub fn block_paths_header(path: &str) -> String {
    format!("--- AVAILABLE CODE BLOCK PATHS for {path} ---")
}

/// The path list advertised for one file, newline-joined.
///
/// Files the index cannot parse (wrong extension, or broken source) are
/// addressable only as `$fullfile`.
#[must_use]
pub fn advertised_paths(path: &str, text: &str) -> String {
    if !atelier_index::is_indexable(path) {
        return FULLFILE_PATH.to_string();
    }
    match navigational_paths(text) {
        Ok(paths) if !paths.is_empty() => paths
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
        Ok(_) => FULLFILE_PATH.to_string(),
        Err(err) => {
            tracing::warn!(path, "Source does not parse ({err}); offering $fullfile only");
            FULLFILE_PATH.to_string()
        }
    }
}

/// Build the single prompt string passed to the model gateway.
#[must_use]
pub fn compose_prompt(
    digest: &WorkspaceDigest,
    strategy: CodeChangeStrategy,
    user_text: &str,
) -> ComposedPrompt {
    let mut prompt = digest.summary();

    if strategy == CodeChangeStrategy::Block {
        for file in digest.files() {
            prompt.push_str("\n\n");
            prompt.push_str(&block_paths_header(&file.path));
            prompt.push('\n');
            prompt.push_str(&advertised_paths(&file.path, &file.text));
        }
    }

    prompt.push_str("\n\n");
    prompt.push_str(USER_INSTRUCTION_HEADER);
    prompt.push('\n');
    prompt.push_str(user_text);

    ComposedPrompt {
        prompt,
        included_files: digest.included_files(),
    }
}
