//! Model (Claude CLI) port and the request/response types shared with adapters.

pub mod client;
pub mod types;
