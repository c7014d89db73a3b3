//! Core domain types for the atelier workbench.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies: structured edits and the block paths that address them,
//! conversation messages, gateway/session events, token accounting, and
//! runtime settings. Everything here can be used from any layer.

pub mod edit;
pub mod event;
pub mod message;
pub mod settings;

pub use edit::{BlockPath, BlockPathError, EditKind, FileEdit};
pub use event::{ApiUsage, SessionEvent, StreamEvent, TokenKind};
pub use message::{ChatMessage, Role};
pub use settings::{
    ApiProvider, CodeChangeStrategy, GeminiParams, OpenAiParams, PromptPaths, Settings,
    TokenDisplay,
};
