//! Streaming events: the gateway's wire-level sequence and the session's
//! caller-facing sequence.
//!
//! Both sequences are delivered over `tokio::sync::mpsc` channels by their
//! producers. Within one turn the order is fixed: text deltas in model
//! order, then at most one usage record, then a terminator.

use serde::{Deserialize, Serialize};

/// Token-accounting categories a client can ask to have surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Prompt,
    Output,
    Thinking,
    Total,
}

/// Terminal token accounting for one model exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUsage {
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
    pub total_tokens: u64,
}

impl ApiUsage {
    /// The counter for one reporting category.
    #[must_use]
    pub fn count(&self, kind: TokenKind) -> u64 {
        match kind {
            TokenKind::Prompt => self.prompt_tokens,
            TokenKind::Output => self.output_tokens,
            TokenKind::Thinking => self.thinking_tokens,
            TokenKind::Total => self.total_tokens,
        }
    }
}

/// Events emitted by a model-gateway backend.
///
/// Sequence contract: zero or more `TextDelta` in model order, then at most
/// one `Usage`, then exactly one of `Done` or `Error`. On cancellation the
/// sequence simply stops; no further events are emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A contiguous substring of the model's output.
    TextDelta(String),
    /// Terminal token accounting, emitted after all deltas.
    Usage(ApiUsage),
    /// Stream completed successfully.
    Done,
    /// Stream terminated with an error; no `Usage` follows.
    Error(String),
}

/// Events delivered to the workbench caller over one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Emitted once after prompt composition, before any model output.
    FilesIncluded {
        files: Vec<String>,
        prompt: String,
    },
    TextChunk(String),
    /// Token accounting filtered to the categories the client asked for.
    Usage {
        usage: ApiUsage,
        display: Vec<TokenKind>,
    },
    /// A workspace snapshot was recorded after a successful apply.
    SnapshotCreated {
        label: String,
        message_id: Option<String>,
    },
    Error(String),
    Done,
}
