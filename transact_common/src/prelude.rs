//! Prelude module for common re-exports.
//!
//! ```rust
//! use transact_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, TransactConfig};

// ─── Wire Constants ─────────────────────────────────────────────────
pub use crate::consts::{BLOCK_HEADER_SIZE, BLOCK_SIZE, NO_BLOCK, ROLE_SELECTOR_MASK};
