use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{errors::Error, Result};

/// File name of the shared append-only log inside `DATA_DIR/logs`.
pub const LOG_FILE_NAME: &str = "bot.log";

/// Initialize logging for the bot: stdout plus `<logs_dir>/bot.log`.
///
/// The returned guard flushes the file writer on drop, so keep it alive for
/// the lifetime of `main`.
pub fn init(service_name: &str, logs_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    // Default: info for our crates. Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "info,ctb=info,ctb_core=info,ctb_telegram=info,ctb_claude_cli=info,{service_name}=info"
        ))
    });

    let appender = tracing_appender::rolling::never(logs_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_ansi(true))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {e}")))?;

    Ok(guard)
}
