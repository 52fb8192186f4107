use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    DontAsk,
    Plan,
}

impl PermissionMode {
    pub fn as_claude_cli_flag(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::DontAsk => "dontAsk",
            PermissionMode::Plan => "plan",
        }
    }

    /// Accepts the CLI spelling (`acceptEdits`) case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        [
            PermissionMode::Default,
            PermissionMode::AcceptEdits,
            PermissionMode::BypassPermissions,
            PermissionMode::DontAsk,
            PermissionMode::Plan,
        ]
        .into_iter()
        .find(|m| m.as_claude_cli_flag().eq_ignore_ascii_case(s))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

#[derive(Clone, Debug)]
pub struct ClaudeCliConfig {
    pub claude_path: PathBuf,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub query_timeout: std::time::Duration,
    pub idle_timeout: std::time::Duration,
    pub max_concurrent: usize,
}

/// How the CLI should treat the session id of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// First run for this id: the CLI creates the conversation (`--session-id`).
    Create,
    /// The CLI already knows this id (`--resume`).
    Resume,
}

/// Normalized request for a single run.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub session_id: SessionId,
    pub session_mode: SessionMode,
    /// Tools the user approved for this session, on top of the configured ones.
    pub allowed_tools: Vec<String>,
}

/// A tool call the CLI refused because it was not pre-approved.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PermissionDenial {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
}

#[derive(Clone, Debug, Default)]
pub struct RunResult {
    pub is_error: bool,
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub permission_denials: Vec<PermissionDenial>,
}

/// Provider-agnostic model events emitted during a run.
///
/// `raw` keeps the CLI's stream-json line for forward-compat as schemas evolve.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    SystemInit { raw: serde_json::Value },
    Assistant { raw: serde_json::Value },
    Tool { raw: serde_json::Value },
    Result { raw: serde_json::Value },
    Unknown { raw: serde_json::Value },
}

/// One `tool_use` block from an assistant message.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolUse {
    pub name: String,
    pub input: serde_json::Value,
}

impl ModelEvent {
    pub fn classify(raw: serde_json::Value) -> Self {
        match raw.get("type").and_then(|v| v.as_str()) {
            Some("system") => ModelEvent::SystemInit { raw },
            Some("assistant") => ModelEvent::Assistant { raw },
            Some("result") => ModelEvent::Result { raw },
            Some("tool_progress") | Some("tool_use_summary") => ModelEvent::Tool { raw },
            _ => ModelEvent::Unknown { raw },
        }
    }

    /// Concatenated `text` blocks of an assistant message.
    pub fn assistant_text(&self) -> Option<String> {
        let ModelEvent::Assistant { raw } = self else {
            return None;
        };
        let text = content_blocks(raw)
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<String>();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// `permission_denials` of a result event. Malformed entries are skipped.
    pub fn permission_denials(&self) -> Vec<PermissionDenial> {
        let ModelEvent::Result { raw } = self else {
            return Vec::new();
        };
        raw.get("permission_denials")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|d| serde_json::from_value(d.clone()).ok())
            .collect()
    }

    /// `tool_use` blocks of an assistant message.
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        let ModelEvent::Assistant { raw } = self else {
            return Vec::new();
        };
        content_blocks(raw)
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_use"))
            .map(|b| ToolUse {
                name: b
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("tool")
                    .to_string(),
                input: b.get("input").cloned().unwrap_or(serde_json::Value::Null),
            })
            .collect()
    }
}

fn content_blocks(raw: &serde_json::Value) -> impl Iterator<Item = &serde_json::Value> {
    raw.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
}
