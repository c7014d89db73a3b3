//! Shared infrastructure utilities for the atelier workbench.
//!
//! Cross-cutting helpers that multiple crates need but that don't belong in
//! the domain-pure `atelier-types` crate:
//!
//! - **`atomic_write`**: crash-safe file persistence (temp + rename)
//! - **`diff`**: line-level change stats for apply logging

pub mod atomic_write;
pub mod diff;

pub use atomic_write::atomic_write;
pub use diff::{DiffStats, diff_stats};
