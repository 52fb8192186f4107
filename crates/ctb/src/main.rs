use std::{sync::Arc, time::SystemTime};

use ctb_claude_cli::ClaudeCliClient;

use ctb_core::{config::Config, media::MediaStore, model::types::ClaudeCliConfig};

#[tokio::main]
async fn main() -> Result<(), ctb_core::Error> {
    let cfg = Arc::new(Config::load()?);
    cfg.ensure_dirs()?;
    // Flushes the log file on drop; keep it for the whole run.
    let _log_guard = ctb_core::logging::init("ctb", &cfg.logs_dir())?;

    tracing::info!(
        claude = %cfg.claude_cli_path.display(),
        model = cfg.claude_model.as_deref().unwrap_or("default"),
        permission_mode = cfg.permission_mode.as_claude_cli_flag(),
        session_timeout_hours = cfg.session_timeout.map(|d| d.as_secs() / 3600),
        max_concurrent = cfg.max_concurrent_invocations,
        "starting ctb"
    );

    if let Some(retention) = cfg.media_retention {
        match MediaStore::new(cfg.media_dir()).evict_older_than(None, retention, SystemTime::now()) {
            Ok(n) => tracing::info!(removed = n, "startup media sweep"),
            Err(e) => tracing::warn!(error = %e, "startup media sweep failed"),
        }
    }

    let model = Arc::new(ClaudeCliClient::new(ClaudeCliConfig {
        claude_path: cfg.claude_cli_path.clone(),
        model: cfg.claude_model.clone(),
        permission_mode: cfg.permission_mode,
        allowed_tools: cfg.allowed_tools.clone(),
        query_timeout: cfg.query_timeout,
        idle_timeout: cfg.idle_timeout,
        max_concurrent: cfg.max_concurrent_invocations,
    }));

    ctb_telegram::router::run_polling(cfg, model)
        .await
        .map_err(|e| ctb_core::Error::Transport(format!("telegram bot failed: {e}")))?;

    Ok(())
}
