use chrono::{DateTime, Utc};

use ctb_core::{
    formatting::{escape_html, human_duration},
    session::{SessionEntry, SwitchOutcome},
};

use crate::router::AppState;

use super::{enqueue, RequestContext};

const SESSIONS_SHOWN: usize = 10;

const HELP: &str = "Send text, a photo or a document and I'll pass it to Claude Code, \
running in your own workspace. Files Claude creates or changes come back as documents.

/reset: start a new conversation
/status: current session and workspace
/sessions: recent conversations
/switch <id>: go back to an earlier conversation
/stop: stop the running request
/help: this message

Other slash commands are passed through to Claude.";

/// Bot commands handled here. Anything else starting with `/` goes to Claude.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Reset,
    Status,
    Sessions,
    Switch(String),
    Stop,
}

/// Parse `/cmd@botname args`. `None` for plain text and unknown commands.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    match cmd.as_str() {
        "start" => Some(Command::Start),
        "help" => Some(Command::Help),
        "reset" | "new" => Some(Command::Reset),
        "status" => Some(Command::Status),
        "sessions" => Some(Command::Sessions),
        "switch" | "resume" => Some(Command::Switch(rest)),
        "stop" => Some(Command::Stop),
        _ => None,
    }
}

fn ago(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let d = (now - then).to_std().unwrap_or_default();
    format!("{} ago", human_duration(d))
}

fn session_line(entry: &SessionEntry, now: DateTime<Utc>, active: bool) -> String {
    let marker = if active { "▶️" } else { "•" };
    let mut line = format!(
        "{marker} <code>{}</code> {} turn(s), {}",
        escape_html(entry.session_id.short()),
        entry.turns,
        ago(entry.last_activity, now)
    );
    if let Some(preview) = &entry.preview {
        line.push_str(&format!(": {}", escape_html(preview)));
    }
    line
}

/// Run `cmd` for the user. `/reset` and `/switch` wait on the user's lane so
/// prompts sent before them still run in the session they were meant for.
pub(super) async fn dispatch(state: &AppState, ctx: RequestContext, cmd: Command) {
    match cmd {
        Command::Reset | Command::Switch(_) => {
            let lane_state = state.clone();
            enqueue(state, ctx, async move {
                handle_command(&lane_state, ctx, cmd).await;
            })
            .await;
        }
        _ => handle_command(state, ctx, cmd).await,
    }
}

pub(super) async fn handle_command(state: &AppState, ctx: RequestContext, cmd: Command) {
    tracing::info!(user_id = ctx.user_id.0, command = ?cmd, "command");
    let reply = match run_command(state, ctx, cmd).await {
        Ok(html) => html,
        Err(e) => {
            tracing::warn!(user_id = ctx.user_id.0, error = %e, "command failed");
            format!("❌ {}", escape_html(&e.to_string()))
        }
    };
    if let Err(e) = state.messenger.send_html(ctx.chat_id, &reply).await {
        tracing::warn!(error = %e, "failed to send command reply");
    }
}

/// The HTML reply for `cmd`.
async fn run_command(state: &AppState, ctx: RequestContext, cmd: Command) -> ctb_core::Result<String> {
    let sessions = state.relay.sessions();
    let now = Utc::now();

    let html = match cmd {
        Command::Start => format!(
            "👋 Hi! I relay your messages to Claude Code.\n\n{}",
            escape_html(HELP)
        ),
        Command::Help => escape_html(HELP),
        Command::Reset => {
            let id = sessions.reset(ctx.user_id).await?;
            format!(
                "🆕 New session started.\nSession: <code>{}</code>",
                escape_html(id.as_str())
            )
        }
        Command::Status => {
            let record = sessions.list(ctx.user_id).await;
            let mut out = String::from("<b>Status</b>\n");
            match &record.active {
                Some(s) if !s.is_expired_at(sessions.timeout(), now) => {
                    out.push_str(&format!(
                        "Session: <code>{}</code>\nStarted: {}\nLast activity: {}\nTurns: {}\n",
                        escape_html(s.session_id.as_str()),
                        ago(s.created_at, now),
                        ago(s.last_activity, now),
                        s.turns
                    ));
                }
                Some(_) => out.push_str("Session: expired, the next message starts a new one\n"),
                None => out.push_str("Session: none yet\n"),
            }
            out.push_str(&format!(
                "Workspace: <code>{}</code>\n",
                escape_html(&state.cfg.user_workspace(ctx.user_id).display().to_string())
            ));
            let running = state.relay.active_runs().is_running(ctx.user_id);
            let pending = state.queues.pending(ctx.user_id);
            out.push_str(match (running, pending) {
                (true, _) => "Claude: working",
                (false, 0) => "Claude: idle",
                (false, _) => "Claude: starting",
            });
            let waiting = pending.saturating_sub(1);
            if waiting > 0 {
                out.push_str(&format!(" ({waiting} queued)"));
            }
            out
        }
        Command::Sessions => {
            let record = sessions.list(ctx.user_id).await;
            if record.active.is_none() && record.history.is_empty() {
                "No sessions yet. Send a message to start one.".to_string()
            } else {
                let mut lines = vec!["<b>Sessions</b>".to_string()];
                if let Some(active) = &record.active {
                    lines.push(session_line(active, now, true));
                }
                for entry in record.history.iter().take(SESSIONS_SHOWN) {
                    lines.push(session_line(entry, now, false));
                }
                lines.push(String::new());
                lines.push("Use /switch &lt;id&gt; to go back to one.".to_string());
                lines.join("\n")
            }
        }
        Command::Switch(prefix) if prefix.is_empty() => {
            "Usage: /switch &lt;id&gt; (see /sessions)".to_string()
        }
        Command::Switch(prefix) => match sessions.switch(ctx.user_id, &prefix).await? {
            SwitchOutcome::Switched(entry) => format!(
                "🔀 Switched to session <code>{}</code> ({} turn(s)).",
                escape_html(entry.session_id.as_str()),
                entry.turns
            ),
            SwitchOutcome::NotFound => format!(
                "No session starts with <code>{}</code>.",
                escape_html(&prefix)
            ),
            SwitchOutcome::Ambiguous(n) => format!(
                "{n} sessions start with <code>{}</code>; use a longer prefix.",
                escape_html(&prefix)
            ),
        },
        Command::Stop => {
            if state.relay.active_runs().cancel(ctx.user_id) {
                "🛑 Stopping…".to_string()
            } else {
                "Nothing is running.".to_string()
            }
        }
    };
    Ok(html)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::super::test_support::{ctx, state, state_with_model, GatedModel};
    use super::super::text::handle_text;
    use super::*;

    #[test]
    fn parses_known_commands_and_bot_suffix() {
        assert_eq!(parse_command("/start"), Some(Command::Start));
        assert_eq!(parse_command("/HELP"), Some(Command::Help));
        assert_eq!(parse_command("/reset@my_claude_bot"), Some(Command::Reset));
        assert_eq!(parse_command("/new"), Some(Command::Reset));
        assert_eq!(
            parse_command("/switch  1a2b3c "),
            Some(Command::Switch("1a2b3c".to_string()))
        );
        assert_eq!(parse_command("/switch"), Some(Command::Switch(String::new())));
        assert_eq!(parse_command("/stop"), Some(Command::Stop));
    }

    #[test]
    fn unknown_commands_and_text_are_not_commands() {
        assert_eq!(parse_command("/compact"), None);
        assert_eq!(parse_command("hello /reset"), None);
        assert_eq!(parse_command("2+2?"), None);
    }

    #[tokio::test]
    async fn reset_replies_with_the_new_session_id() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, messenger) = state(tmp.path());
        let before = state.relay.sessions().get_or_create(ctx().user_id).await.unwrap();

        handle_command(&state, ctx(), Command::Reset).await;

        let record = state.relay.sessions().list(ctx().user_id).await;
        let new_id = record.active.unwrap().session_id;
        assert_ne!(new_id, before.session_id);
        let sent = messenger.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(new_id.as_str()), "{}", sent[0]);
    }

    #[tokio::test]
    async fn sessions_and_switch_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, messenger) = state(tmp.path());
        let first = state.relay.sessions().get_or_create(ctx().user_id).await.unwrap();
        state
            .relay
            .sessions()
            .touch(ctx().user_id, &first.session_id, "build a parser")
            .await
            .unwrap();
        state.relay.sessions().reset(ctx().user_id).await.unwrap();

        handle_command(&state, ctx(), Command::Sessions).await;
        let listing = messenger.sent().pop().unwrap();
        assert!(listing.contains(first.session_id.short()));
        assert!(listing.contains("build a parser"));

        let prefix = first.session_id.short().to_string();
        handle_command(&state, ctx(), Command::Switch(prefix)).await;
        assert!(messenger.sent().pop().unwrap().starts_with("🔀 Switched"));
        let record = state.relay.sessions().list(ctx().user_id).await;
        assert_eq!(record.active.unwrap().session_id, first.session_id);

        handle_command(&state, ctx(), Command::Switch("zzzz".to_string())).await;
        assert_eq!(
            messenger.sent().pop().unwrap(),
            "No session starts with <code>zzzz</code>."
        );
    }

    #[tokio::test]
    async fn stop_without_a_run_says_so() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, messenger) = state(tmp.path());
        handle_command(&state, ctx(), Command::Stop).await;
        assert_eq!(messenger.sent(), vec!["Nothing is running.".to_string()]);
    }

    #[tokio::test]
    async fn status_shows_workspace_and_idle_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, messenger) = state(tmp.path());
        handle_command(&state, ctx(), Command::Status).await;
        let status = messenger.sent().pop().unwrap();
        assert!(status.contains("Session: none yet"));
        assert!(status.contains("user_7"));
        assert!(status.ends_with("Claude: idle"));
    }

    #[tokio::test]
    async fn reset_waits_for_prompts_sent_before_it() {
        let tmp = tempfile::tempdir().unwrap();
        let model = Arc::new(GatedModel::default());
        let (state, messenger) = state_with_model(tmp.path(), model.clone());

        handle_text(&state, ctx(), "first".to_string()).await;
        model.entered.notified().await;
        handle_text(&state, ctx(), "sent before reset".to_string()).await;
        dispatch(&state, ctx(), Command::Reset).await;
        handle_text(&state, ctx(), "sent after reset".to_string()).await;
        model.gate.notify_one();

        tokio::time::timeout(Duration::from_secs(5), async {
            while state.queues.pending(ctx().user_id) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lane did not drain");

        let runs = model.runs();
        let prompts: Vec<&str> = runs.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(prompts, vec!["first", "sent before reset", "sent after reset"]);
        assert_eq!(runs[0].1, runs[1].1);
        assert_ne!(runs[1].1, runs[2].1);
        assert!(messenger
            .sent()
            .iter()
            .any(|s| s.starts_with("🆕 New session started.")));
    }

    #[tokio::test]
    async fn stop_does_not_wait_on_the_lane() {
        let tmp = tempfile::tempdir().unwrap();
        let model = Arc::new(GatedModel::default());
        let (state, messenger) = state_with_model(tmp.path(), model.clone());

        handle_text(&state, ctx(), "long job".to_string()).await;
        model.entered.notified().await;
        dispatch(&state, ctx(), Command::Stop).await;

        assert!(messenger.sent().contains(&"🛑 Stopping…".to_string()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.queues.pending(ctx().user_id) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cancelled run did not finish");
        assert!(messenger.sent().contains(&"🛑 Stopped.".to_string()));
    }
}
