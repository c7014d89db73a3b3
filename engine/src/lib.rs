//! Edit pipeline for the atelier workbench.
//!
//! This crate orchestrates one conversation turn end to end: the prompt
//! composer embeds the live workspace digest (and, under the block
//! strategy, each file's navigational paths), the history optimizer
//! replaces still-accurate file snapshots in earlier turns with
//! placeholders, the model gateway streams the exchange, and — on an
//! explicit apply — the envelope parser and edit applier rewrite the
//! workspace and record a snapshot.

pub mod applier;
pub mod composer;
pub mod envelope;
pub mod optimizer;
pub mod session;

pub use applier::{ApplyReport, apply_edits};
pub use composer::{ComposedPrompt, compose_prompt};
pub use envelope::{EnvelopeError, parse_changes};
pub use optimizer::{optimize_history, window_history};
pub use session::Session;
