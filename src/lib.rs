//! atelier — an AI-assisted code-editing workbench.
//!
//! The heavy lifting lives in the member crates; this crate binds them
//! together behind one import and owns the configuration surface. The
//! binary entry point in `main.rs` is a thin stdin-driven front end.

mod config;

pub use config::{CONFIG_FILE_NAME, load_settings, parse_settings};

pub use atelier_engine::{ApplyReport, ComposedPrompt, Session};
pub use atelier_types::{ChatMessage, SessionEvent, Settings};
pub use atelier_workspace::{SnapshotStore, read_workspace};
