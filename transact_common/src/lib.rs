//! Transact Common Library
//!
//! Wire constants and configuration loading shared by the transact crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Arena/session layout constants (the cross-process contract)
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! transact = { package = "transact_common", path = "../transact_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use transact_common::consts::*;
//! use transact_common::config::{ConfigLoader, TransactConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
