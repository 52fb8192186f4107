//! Core domain and application logic for the Claude Telegram relay bot.
//!
//! Framework-agnostic: Telegram and the Claude CLI live behind ports (traits)
//! implemented in adapter crates.

pub mod access;
pub mod approvals;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod locks;
pub mod logging;
pub mod media;
pub mod messaging;
pub mod model;
pub mod relay;
pub mod session;
pub mod splitter;
pub mod workspace;

pub use errors::{Error, Result};
