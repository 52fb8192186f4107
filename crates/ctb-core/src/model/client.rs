use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

use super::types::*;

/// A concrete CLI invocation (used by the `claude` runner).
#[derive(Clone, Debug)]
pub struct CliInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Turns a [`RunRequest`] into `claude` CLI flags.
#[derive(Clone, Debug)]
pub struct ClaudeCliPromptAdapter {
    pub cfg: ClaudeCliConfig,
}

impl ClaudeCliPromptAdapter {
    /// Build `claude` CLI args for a run.
    pub fn build_invocation(&self, req: &RunRequest) -> CliInvocation {
        let mut args: Vec<String> = vec![
            // Non-interactive streaming NDJSON.
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            // Permissions / tools
            "--permission-mode".to_string(),
            self.cfg.permission_mode.as_claude_cli_flag().to_string(),
        ];
        let mut tools: Vec<&str> = Vec::new();
        for tool in self.cfg.allowed_tools.iter().chain(&req.allowed_tools) {
            if !tools.contains(&tool.as_str()) {
                tools.push(tool);
            }
        }
        if !tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }

        // Model selection
        if let Some(model) = &self.cfg.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        // Session: create on the first run, resume afterwards.
        match req.session_mode {
            SessionMode::Create => args.push("--session-id".to_string()),
            SessionMode::Resume => args.push("--resume".to_string()),
        }
        args.push(req.session_id.as_str().to_string());

        // Prompt as the final positional argument; `--` keeps a leading '-' literal.
        args.push("--".to_string());
        args.push(req.prompt.clone());

        CliInvocation {
            program: self.cfg.claude_path.clone(),
            args,
            cwd: req.cwd.clone(),
        }
    }
}

/// Model client interface used by the request relay.
///
/// Callback-based streaming keeps dependencies light and lets provider
/// implementations drive their own read loops. Each run gets its own
/// cancellation token so several users can run at once.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn run(
        &self,
        req: RunRequest,
        cancel: CancellationToken,
        on_event: &mut (dyn FnMut(ModelEvent) -> Result<()> + Send),
    ) -> Result<RunResult>;
}
