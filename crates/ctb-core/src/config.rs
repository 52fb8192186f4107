use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::UserId, errors::Error, model::types::PermissionMode, Result};

/// Typed configuration for the bot.
///
/// Loaded from the process environment, optionally seeded from a `.env` file
/// in the working directory.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub allowed_username: String,
    pub workspace_dir: PathBuf,
    pub data_dir: PathBuf,
    pub session_timeout: Option<Duration>,

    // Claude CLI
    pub claude_cli_path: PathBuf,
    pub claude_model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub query_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_concurrent_invocations: usize,
    /// How long a permission or question prompt waits for a button press.
    pub approval_timeout: Duration,

    // Media
    pub media_retention: Option<Duration>,

    // Telegram limits
    pub telegram_message_limit: usize,
    pub max_upload_bytes: u64,
    pub streaming_throttle: Duration,

    // Behavior flags
    pub show_tool_activity: bool,
}

const HOUR: u64 = 60 * 60;

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        // Required
        let telegram_bot_token = vars.required("TELEGRAM_BOT_TOKEN")?;
        let allowed_username = vars
            .required("ALLOWED_USERNAME")?
            .trim_start_matches('@')
            .to_string();
        if allowed_username.is_empty() {
            return Err(Error::Config(
                "ALLOWED_USERNAME must name a Telegram username".to_string(),
            ));
        }
        let workspace_dir = PathBuf::from(vars.required("WORKSPACE_DIR")?);
        let data_dir = PathBuf::from(vars.required("DATA_DIR")?);

        let session_timeout_hours = vars.parse::<u64>("SESSION_TIMEOUT_HOURS")?.unwrap_or(24);
        let session_timeout = hours(session_timeout_hours);

        // Claude CLI path: explicit, else `claude` on PATH.
        let claude_cli_path = match vars.get("CLAUDE_CLI_PATH") {
            Some(p) => PathBuf::from(p),
            None => which_in_path("claude").ok_or_else(|| {
                Error::Config(
                    "CLAUDE_CLI_PATH is not set and `claude` was not found on PATH".to_string(),
                )
            })?,
        };
        let claude_model = vars.get("CLAUDE_MODEL");
        let permission_mode = match vars.get("CLAUDE_PERMISSION_MODE") {
            Some(v) => PermissionMode::parse(&v).ok_or_else(|| {
                Error::Config(format!("CLAUDE_PERMISSION_MODE has unknown value {v:?}"))
            })?,
            None => PermissionMode::BypassPermissions,
        };
        let allowed_tools = parse_csv(vars.get("CLAUDE_ALLOWED_TOOLS"));

        let query_timeout =
            Duration::from_secs(vars.parse::<u64>("CLAUDE_TIMEOUT_SECS")?.unwrap_or(30 * 60));
        let idle_timeout =
            Duration::from_secs(vars.parse::<u64>("CLAUDE_IDLE_TIMEOUT_SECS")?.unwrap_or(10 * 60));
        let max_concurrent_invocations = vars
            .parse::<usize>("MAX_CONCURRENT_INVOCATIONS")?
            .unwrap_or(2)
            .max(1);
        let approval_timeout =
            Duration::from_secs(vars.parse::<u64>("PERMISSION_TIMEOUT_SECS")?.unwrap_or(5 * 60));

        let media_retention = hours(vars.parse::<u64>("MEDIA_RETENTION_HOURS")?.unwrap_or(24));

        let telegram_message_limit = vars
            .parse::<usize>("TELEGRAM_MESSAGE_LIMIT")?
            .unwrap_or(4096)
            .clamp(64, 4096);
        let max_upload_bytes = vars
            .parse::<u64>("MAX_UPLOAD_BYTES")?
            .unwrap_or(50 * 1024 * 1024);
        let streaming_throttle =
            Duration::from_millis(vars.parse::<u64>("STREAMING_THROTTLE_MS")?.unwrap_or(2000));

        let show_tool_activity = vars.bool("SHOW_TOOL_ACTIVITY")?.unwrap_or(true);

        Ok(Self {
            telegram_bot_token,
            allowed_username,
            workspace_dir,
            data_dir,
            session_timeout,
            claude_cli_path,
            claude_model,
            permission_mode,
            allowed_tools,
            query_timeout,
            idle_timeout,
            max_concurrent_invocations,
            approval_timeout,
            media_retention,
            telegram_message_limit,
            max_upload_bytes,
            streaming_throttle,
            show_tool_activity,
        })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// `WORKSPACE_DIR/user_<id>`: the CLI working directory for one user.
    pub fn user_workspace(&self, user_id: UserId) -> PathBuf {
        self.workspace_dir.join(user_dir_name(user_id))
    }

    /// Create the top-level directories the bot writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.workspace_dir.clone(),
            self.sessions_dir(),
            self.media_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Directory / file stem shared by every per-user location.
pub fn user_dir_name(user_id: UserId) -> String {
    format!("user_{}", user_id.0)
}

fn hours(n: u64) -> Option<Duration> {
    if n == 0 {
        None
    } else {
        Some(Duration::from_secs(n.saturating_mul(HOUR)))
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).and_then(non_empty)
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} has invalid value {raw:?}")))
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::Config(format!("{key} has invalid value {raw:?}"))),
        }
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
