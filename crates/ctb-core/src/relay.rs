//! Per-request pipeline: session → Claude run → reply chunks → artifact uploads.
//!
//! The Telegram layer handles access filtering and per-user ordering, then
//! hands a [`UserRequest`] to [`Relay::handle`]. Every failure is reported to
//! that user only and never touches other users' sessions or workspaces.
//!
//! Tool denials and `AskUserQuestion` calls on a result are put to the user
//! as buttons (see [`crate::approvals`]) and the session is resumed with the
//! answer.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use tokio::{
    sync::{mpsc, oneshot},
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    approvals::{
        answers_text, approval_keyboard, continue_prompt, join_replies, parse_questions,
        permission_request_text, question_keyboard, Choice, DenialPlan, PendingPrompts,
        ASK_USER_TOOL, MAX_PERMISSION_ROUNDS, SAFE_TOOLS,
    },
    config::Config,
    domain::{ChatId, MessageRef, SessionId, UserId},
    errors::Error,
    formatting::{
        convert_markdown_to_html, format_tool_activity_log, format_tool_status, human_duration,
        human_size, truncate_text,
    },
    media::MediaStore,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, InlineKeyboard},
    },
    model::{
        client::ModelClient,
        types::{
            ModelEvent, PermissionDenial, PermissionMode, RunRequest, RunResult, SessionMode,
        },
    },
    session::{SessionEntry, SessionStore},
    splitter::{self, FenceBalancer},
    workspace::{Artifact, WorkspaceSnapshot},
    Result,
};

/// Callback data prefix of the 🛑 Stop button: `stop:<user id>`.
pub const STOP_CALLBACK_PREFIX: &str = "stop:";

const TYPING_INTERVAL: Duration = Duration::from_secs(4);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const STATUS_PREVIEW_CHARS: usize = 800;
const MAX_ACTIVITY_LINES: usize = 15;
const MAX_ERROR_CHARS: usize = 3000;

pub fn stop_keyboard(user_id: UserId) -> InlineKeyboard {
    InlineKeyboard::single("🛑 Stop", format!("{STOP_CALLBACK_PREFIX}{}", user_id.0))
}

/// Parse `stop:<user id>` callback data.
pub fn parse_stop_callback(data: &str) -> Option<UserId> {
    data.strip_prefix(STOP_CALLBACK_PREFIX)?
        .parse::<i64>()
        .ok()
        .map(UserId)
}

/// One prompt from an allowed user, ready for Claude.
#[derive(Clone, Debug)]
pub struct UserRequest {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub prompt: String,
}

/// What a finished request did.
#[derive(Clone, Debug, Default)]
pub struct RequestOutcome {
    pub session_id: Option<SessionId>,
    pub chunks_sent: usize,
    pub uploaded: Vec<Artifact>,
    pub skipped_uploads: Vec<Artifact>,
    pub failed_uploads: usize,
    pub cancelled: bool,
    pub error: Option<String>,
}

/// Cancellation tokens of in-flight runs, one per user.
#[derive(Default)]
pub struct ActiveRuns {
    inner: Mutex<HashMap<UserId, CancellationToken>>,
}

impl ActiveRuns {
    fn register(&self, user_id: UserId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(user_id, token.clone());
        }
        token
    }

    fn finish(&self, user_id: UserId) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&user_id);
        }
    }

    /// Cancel the user's running request. `false` when nothing is running.
    pub fn cancel(&self, user_id: UserId) -> bool {
        let token = self
            .inner
            .lock()
            .ok()
            .and_then(|map| map.get(&user_id).cloned());
        match token {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, user_id: UserId) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(&user_id))
            .unwrap_or(false)
    }
}

pub struct Relay {
    cfg: Arc<Config>,
    sessions: Arc<SessionStore>,
    media: MediaStore,
    model: Arc<dyn ModelClient>,
    messenger: Arc<dyn MessagingPort>,
    active: ActiveRuns,
    prompts: PendingPrompts,
}

impl Relay {
    pub fn new(
        cfg: Arc<Config>,
        sessions: Arc<SessionStore>,
        media: MediaStore,
        model: Arc<dyn ModelClient>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            cfg,
            sessions,
            media,
            model,
            messenger,
            active: ActiveRuns::default(),
            prompts: PendingPrompts::default(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    pub fn messenger(&self) -> &Arc<dyn MessagingPort> {
        &self.messenger
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.active
    }

    /// Permission and question prompts waiting for a button press.
    pub fn prompts(&self) -> &PendingPrompts {
        &self.prompts
    }

    /// Run one request end to end. Errors are turned into a message for the
    /// user and recorded in the outcome; they are never propagated.
    pub async fn handle(&self, req: UserRequest) -> RequestOutcome {
        let started = Instant::now();
        let mut outcome = RequestOutcome::default();

        if let Err(e) = self.run(&req, &mut outcome).await {
            tracing::warn!(user_id = req.user_id.0, error = %e, "request failed");
            outcome.error = Some(e.to_string());
            self.report_error(req.chat_id, &e).await;
        }

        self.evict_media(req.user_id);
        tracing::info!(
            user_id = req.user_id.0,
            chunks = outcome.chunks_sent,
            uploads = outcome.uploaded.len(),
            cancelled = outcome.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request finished"
        );
        outcome
    }

    async fn run(&self, req: &UserRequest, outcome: &mut RequestOutcome) -> Result<()> {
        // SessionResolved
        let session = self.sessions.get_or_create(req.user_id).await?;
        outcome.session_id = Some(session.session_id.clone());
        let workspace = self.cfg.user_workspace(req.user_id);
        tokio::fs::create_dir_all(&workspace).await?;
        let before = capture_snapshot(workspace.clone()).await?;

        // Invoking
        let run = self.invoke(req, &session, workspace.clone()).await;
        let text = match run {
            Ok(text) => text,
            Err(Failed {
                error: Error::Cancelled,
                partial,
            }) => {
                outcome.cancelled = true;
                if !partial.trim().is_empty() {
                    outcome.chunks_sent = self.send_response(req.chat_id, &partial).await?;
                }
                self.messenger
                    .send_text(req.chat_id, "🛑 Stopped.")
                    .await?;
                return Ok(());
            }
            Err(Failed { error, .. }) => return Err(error),
        };

        // Splitting & sending
        if text.reply.trim().is_empty() {
            self.messenger
                .send_text(req.chat_id, "✅ Done (no text output).")
                .await?;
            outcome.chunks_sent = 1;
        } else {
            outcome.chunks_sent = self.send_response(req.chat_id, &text.reply).await?;
        }
        if self.cfg.show_tool_activity {
            if let Some(log) = format_tool_activity_log(&text.tool_lines, MAX_ACTIVITY_LINES) {
                if let Err(e) = self.messenger.send_html(req.chat_id, &log).await {
                    tracing::warn!(error = %e, "failed to send tool activity log");
                }
            }
        }

        // Scanning workspace & uploading artifacts
        let after = capture_snapshot(workspace).await?;
        self.upload_artifacts(req.chat_id, after.changed_since(&before), outcome)
            .await;
        Ok(())
    }

    /// Run Claude, then settle any permission or question prompts and resume
    /// the session until the reply no longer asks for anything.
    async fn invoke(
        &self,
        req: &UserRequest,
        session: &SessionEntry,
        workspace: PathBuf,
    ) -> std::result::Result<RunText, Failed> {
        let token = self.active.register(req.user_id);
        let out = self.converse(req, session, workspace, &token).await;
        self.active.finish(req.user_id);
        out
    }

    async fn converse(
        &self,
        req: &UserRequest,
        session: &SessionEntry,
        workspace: PathBuf,
        token: &CancellationToken,
    ) -> std::result::Result<RunText, Failed> {
        let mut prompt = req.prompt.clone();
        let mut session_mode = session.session_mode();
        let mut approved = session.approved_tools.clone();
        let mut granted: Vec<String> = Vec::new();
        let mut reply = String::new();
        let mut tool_lines = Vec::new();
        let mut started = false;
        let mut rounds = 0;

        loop {
            let mut allowed_tools = Vec::new();
            if self.cfg.permission_mode != PermissionMode::BypassPermissions {
                allowed_tools.extend(SAFE_TOOLS.iter().map(|t| t.to_string()));
            }
            allowed_tools.extend(approved.iter().cloned());
            allowed_tools.extend(granted.iter().cloned());

            let run_req = RunRequest {
                prompt: prompt.clone(),
                cwd: workspace.clone(),
                session_id: session.session_id.clone(),
                session_mode,
                allowed_tools,
            };
            let (result, progress) = self.run_once(req, run_req, token.clone()).await;
            started |= progress.cli_started;
            tool_lines.extend(progress.tool_lines.iter().cloned());

            let partial = progress.text();
            let run = match result {
                Ok(run) if run.is_error => Err(Error::Invocation(non_empty_or(
                    run.text,
                    "Claude reported an error without details",
                ))),
                other => other,
            };
            let run = match run {
                Ok(run) => run,
                Err(error) => {
                    // The CLI already created the conversation; later runs must resume it.
                    if started && session.turns == 0 {
                        self.touch(req, session).await;
                    }
                    return Err(Failed {
                        error,
                        partial: join_replies(reply, partial),
                    });
                }
            };
            started = true;
            let text = if partial.trim().is_empty() {
                run.text
            } else {
                partial
            };
            reply = join_replies(reply, text);

            let plan = DenialPlan::from_denials(&run.permission_denials);
            if plan.is_empty() {
                break;
            }
            if rounds >= MAX_PERMISSION_ROUNDS {
                tracing::warn!(user_id = req.user_id.0, rounds, "permission rounds exhausted");
                break;
            }
            rounds += 1;

            let next = match self.settle_prompts(req, session, &plan, token).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(error) => {
                    self.touch(req, session).await;
                    return Err(Failed {
                        error,
                        partial: reply,
                    });
                }
            };
            for tool in next.tools {
                if !granted.contains(&tool) {
                    granted.push(tool);
                }
            }
            if let Some(list) = next.approved {
                approved = list;
            }
            prompt = next.prompt;
            session_mode = SessionMode::Resume;
        }

        self.touch(req, session).await;
        Ok(RunText { reply, tool_lines })
    }

    /// One CLI run with its status message and progress stream.
    async fn run_once(
        &self,
        req: &UserRequest,
        run_req: RunRequest,
        token: CancellationToken,
    ) -> (Result<RunResult>, Progress) {
        let status = match self
            .messenger
            .send_inline_keyboard(req.chat_id, "⏳ Working…", stop_keyboard(req.user_id))
            .await
        {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(error = %e, "failed to send status message");
                None
            }
        };

        let (tx, rx) = mpsc::unbounded_channel::<ModelEvent>();
        let processor = tokio::spawn(drive_progress(
            self.messenger.clone(),
            req.chat_id,
            status,
            stop_keyboard(req.user_id),
            self.cfg.streaming_throttle,
            rx,
        ));

        tracing::info!(
            user_id = req.user_id.0,
            session = %run_req.session_id,
            mode = ?run_req.session_mode,
            allowed_tools = run_req.allowed_tools.len(),
            "invoking claude"
        );
        let result = {
            let mut on_event = |ev: ModelEvent| -> Result<()> {
                tx.send(ev)
                    .map_err(|_| Error::Invocation("event processor stopped".to_string()))
            };
            self.model.run(run_req, token, &mut on_event).await
        };
        drop(tx);

        let progress = processor.await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "progress task failed");
            Progress::default()
        });
        if let Some(status) = status {
            if let Err(e) = self.messenger.delete_message(status).await {
                tracing::debug!(error = %e, "failed to delete status message");
            }
        }
        (result, progress)
    }

    /// Ask the user about the denials of one run. `None` when nothing was
    /// granted or answered, so there is nothing to retry.
    async fn settle_prompts(
        &self,
        req: &UserRequest,
        session: &SessionEntry,
        plan: &DenialPlan,
        token: &CancellationToken,
    ) -> Result<Option<NextRound>> {
        let answers = match &plan.question {
            Some(input) => Some(self.ask_questions(req, input, token).await?),
            None => None,
        };

        let mut next = NextRound {
            prompt: String::new(),
            tools: plan.auto_approved.clone(),
            approved: None,
        };
        let mut granted = false;
        if !plan.needs_approval.is_empty() {
            if !self.ask_permission(req, &plan.needs_approval, token).await? {
                if answers.is_none() {
                    return Ok(None);
                }
            } else {
                let names = plan.tool_names();
                match self
                    .sessions
                    .approve_tools(req.user_id, &session.session_id, &names)
                    .await
                {
                    Ok(all) => next.approved = Some(all),
                    Err(e) => {
                        tracing::warn!(user_id = req.user_id.0, error = %e, "failed to save approvals");
                        next.tools.extend(names);
                    }
                }
                granted = true;
            }
        } else if answers.is_none() && plan.auto_approved.is_empty() {
            return Ok(None);
        }

        if answers.is_some() {
            next.tools.push(ASK_USER_TOOL.to_string());
        }
        next.prompt = continue_prompt(granted || answers.is_none(), answers.as_deref());
        Ok(Some(next))
    }

    async fn ask_permission(
        &self,
        req: &UserRequest,
        denials: &[PermissionDenial],
        token: &CancellationToken,
    ) -> Result<bool> {
        let text = permission_request_text(denials);
        let (id, rx) = self.prompts.open(req.user_id);
        let msg = match self
            .messenger
            .send_inline_keyboard(req.chat_id, &text, approval_keyboard(&id))
            .await
        {
            Ok(m) => m,
            Err(e) => {
                self.prompts.close(&id);
                tracing::warn!(error = %e, "failed to send permission prompt");
                return Ok(false);
            }
        };

        let choice = self.await_choice(&id, rx, token).await?;
        let verdict = match choice {
            Some(Choice::Approve) => "✅ Approved",
            Some(_) => "❌ Denied",
            None => "⌛ No answer, denied",
        };
        tracing::info!(user_id = req.user_id.0, verdict, "permission prompt settled");
        if let Err(e) = self
            .messenger
            .edit_text(msg, &format!("{text}\n\n{verdict}"), None)
            .await
        {
            tracing::debug!(error = %e, "failed to edit permission prompt");
        }
        Ok(choice == Some(Choice::Approve))
    }

    /// Forward `AskUserQuestion` as one button message per question and
    /// return the prompt that carries the answers back.
    async fn ask_questions(
        &self,
        req: &UserRequest,
        input: &serde_json::Value,
        token: &CancellationToken,
    ) -> Result<String> {
        let questions = parse_questions(input);
        let mut answers = Vec::with_capacity(questions.len());
        for q in &questions {
            if q.options.is_empty() {
                answers.push(None);
                continue;
            }
            let text = q.prompt_text();
            let (id, rx) = self.prompts.open(req.user_id);
            let msg = match self
                .messenger
                .send_inline_keyboard(req.chat_id, &text, question_keyboard(&id, &q.options))
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    self.prompts.close(&id);
                    tracing::warn!(error = %e, "failed to send question");
                    answers.push(None);
                    continue;
                }
            };
            let answer = match self.await_choice(&id, rx, token).await? {
                Some(Choice::Option(idx)) => q.options.get(idx).cloned(),
                _ => None,
            };
            let shown = match &answer {
                Some(a) => format!("{text}\n\n✓ {a}"),
                None => format!("{text}\n\n⌛ No answer"),
            };
            if let Err(e) = self.messenger.edit_text(msg, &shown, None).await {
                tracing::debug!(error = %e, "failed to edit question");
            }
            answers.push(answer);
        }
        Ok(answers_text(&questions, &answers))
    }

    /// Wait for a press on prompt `id`. `None` on timeout; `/stop` cancels.
    async fn await_choice(
        &self,
        id: &str,
        rx: oneshot::Receiver<Choice>,
        token: &CancellationToken,
    ) -> Result<Option<Choice>> {
        let out = tokio::select! {
          _ = token.cancelled() => Err(Error::Cancelled),
          r = timeout(self.cfg.approval_timeout, rx) => Ok(r.ok().and_then(|c| c.ok())),
        };
        self.prompts.close(id);
        out
    }

    async fn touch(&self, req: &UserRequest, session: &SessionEntry) {
        if let Err(e) = self
            .sessions
            .touch(req.user_id, &session.session_id, &req.prompt)
            .await
        {
            tracing::warn!(user_id = req.user_id.0, error = %e, "failed to update session");
        }
    }

    /// Send `text` as one or more messages. Stops at the first chunk Telegram
    /// refuses in both HTML and plain form.
    pub async fn send_response(&self, chat_id: ChatId, text: &str) -> Result<usize> {
        let limit = self
            .cfg
            .telegram_message_limit
            .min(self.messenger.capabilities().max_message_len);
        let split = splitter::split(text, limit);
        let mut fences = FenceBalancer::default();
        let mut sent = 0;

        for chunk in split.chunks() {
            let html = chunk.decorate(&convert_markdown_to_html(&fences.balance(chunk.body)));
            let html_result = if html.chars().count() <= limit {
                self.messenger.send_html(chat_id, &html).await
            } else {
                Err(Error::Transport("rendered HTML exceeds message limit".to_string()))
            };
            if let Err(e) = html_result {
                tracing::debug!(chunk = chunk.index, error = %e, "HTML send failed, retrying as plain text");
                self.messenger
                    .send_text(chat_id, &chunk.render())
                    .await
                    .map_err(|e| match e {
                        Error::Transport(msg) => Error::Transport(format!(
                            "chunk {}/{}: {msg}",
                            chunk.index, chunk.total
                        )),
                        other => other,
                    })?;
            }
            sent += 1;
        }
        Ok(sent)
    }

    async fn upload_artifacts(
        &self,
        chat_id: ChatId,
        artifacts: Vec<Artifact>,
        outcome: &mut RequestOutcome,
    ) {
        let max_bytes = self
            .cfg
            .max_upload_bytes
            .min(self.messenger.capabilities().max_document_bytes);

        for artifact in artifacts {
            let name = artifact.display_name();
            if artifact.len > max_bytes {
                let note = format!(
                    "⚠️ {name} is {}, over the {} upload limit. It stays in your workspace.",
                    human_size(artifact.len),
                    human_size(max_bytes)
                );
                if let Err(e) = self.messenger.send_text(chat_id, &note).await {
                    tracing::warn!(error = %e, "failed to send oversize notice");
                }
                outcome.skipped_uploads.push(artifact);
                continue;
            }

            let _ = self
                .messenger
                .send_chat_action(chat_id, ChatAction::UploadDocument)
                .await;
            match self
                .messenger
                .send_document(chat_id, &artifact.path, Some(&name))
                .await
            {
                Ok(_) => {
                    tracing::info!(file = %name, bytes = artifact.len, "uploaded artifact");
                    outcome.uploaded.push(artifact);
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "artifact upload failed");
                    outcome.failed_uploads += 1;
                }
            }
        }

        if outcome.failed_uploads > 0 {
            let note = format!("⚠️ Failed to send {} file(s).", outcome.failed_uploads);
            if let Err(e) = self.messenger.send_text(chat_id, &note).await {
                tracing::warn!(error = %e, "failed to send upload failure notice");
            }
        }
    }

    async fn report_error(&self, chat_id: ChatId, err: &Error) {
        let text = match err {
            Error::Invocation(msg) => format!(
                "❌ Error while running Claude:\n\n{}",
                truncate_text(msg, MAX_ERROR_CHARS)
            ),
            Error::Transport(msg) => format!(
                "⚠️ Part of the reply could not be delivered: {}",
                truncate_text(msg, MAX_ERROR_CHARS)
            ),
            other => format!("❌ Error: {}", truncate_text(&other.to_string(), MAX_ERROR_CHARS)),
        };
        if let Err(e) = self.messenger.send_text(chat_id, &text).await {
            tracing::error!(error = %e, "failed to report error to user");
        }
    }

    fn evict_media(&self, user_id: UserId) {
        let Some(retention) = self.cfg.media_retention else {
            return;
        };
        match self
            .media
            .evict_older_than(Some(user_id), retention, SystemTime::now())
        {
            Ok(0) => {}
            Ok(n) => tracing::info!(user_id = user_id.0, removed = n, "evicted old media files"),
            Err(e) => tracing::warn!(user_id = user_id.0, error = %e, "media eviction failed"),
        }
    }
}

struct RunText {
    reply: String,
    tool_lines: Vec<String>,
}

struct Failed {
    error: Error,
    partial: String,
}

/// How to resume after a prompt round.
struct NextRound {
    prompt: String,
    /// Granted for this request only.
    tools: Vec<String>,
    /// The session's full approval list after a save.
    approved: Option<Vec<String>>,
}

fn non_empty_or(s: String, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s
    }
}

async fn capture_snapshot(root: PathBuf) -> Result<WorkspaceSnapshot> {
    tokio::task::spawn_blocking(move || WorkspaceSnapshot::capture(&root))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("snapshot task failed: {e}"))))?
}

/// What the stream showed so far.
#[derive(Debug, Default)]
struct Progress {
    text_parts: Vec<String>,
    tool_lines: Vec<String>,
    last_tool: Option<String>,
    cli_started: bool,
}

impl Progress {
    /// Returns whether the visible preview changed.
    fn observe(&mut self, ev: &ModelEvent) -> bool {
        match ev {
            ModelEvent::SystemInit { .. } => {
                self.cli_started = true;
                false
            }
            ModelEvent::Assistant { .. } => {
                self.cli_started = true;
                let mut changed = false;
                if let Some(text) = ev.assistant_text() {
                    self.text_parts.push(text);
                    changed = true;
                }
                for tool in ev.tool_uses() {
                    self.tool_lines
                        .push(format_tool_status(&tool.name, &tool.input));
                    self.last_tool = Some(tool.name);
                    changed = true;
                }
                changed
            }
            _ => false,
        }
    }

    /// Assistant messages joined by a blank line.
    fn text(&self) -> String {
        self.text_parts
            .iter()
            .map(|s| s.trim_end())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn preview(&self, elapsed: Duration) -> String {
        let mut out = format!("⏳ Working… ({})", human_duration(elapsed));
        let text = self.text();
        if !text.is_empty() {
            out.push_str("\n\n");
            out.push_str(&tail_chars(&text, STATUS_PREVIEW_CHARS));
        } else if let Some(tool) = &self.last_tool {
            out.push_str(&format!("\n\n🔧 {tool}"));
        }
        out
    }
}

fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    let skip = count - n;
    format!("…{}", s.chars().skip(skip).collect::<String>())
}

/// Consume model events, keep Telegram's typing indicator alive and edit the
/// status message with a throttled preview.
async fn drive_progress(
    messenger: Arc<dyn MessagingPort>,
    chat_id: ChatId,
    status: Option<MessageRef>,
    keyboard: InlineKeyboard,
    throttle: Duration,
    mut rx: mpsc::UnboundedReceiver<ModelEvent>,
) -> Progress {
    let started = Instant::now();
    let mut progress = Progress::default();
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_typing: Option<Instant> = None;
    let mut last_edit = started;
    let mut last_output = started;
    let mut dirty = false;

    loop {
        tokio::select! {
          _ = tick.tick() => {
            let now = Instant::now();
            if last_typing.map_or(true, |t| now - t >= TYPING_INTERVAL) {
              let _ = messenger.send_chat_action(chat_id, ChatAction::Typing).await;
              last_typing = Some(now);
            }
            let Some(status) = status else { continue; };
            let due = if dirty {
              now - last_edit >= throttle
            } else {
              now - last_output >= HEARTBEAT_INTERVAL && now - last_edit >= HEARTBEAT_INTERVAL
            };
            if due {
              let text = progress.preview(now - started);
              if let Err(e) = messenger.edit_text(status, &text, Some(keyboard.clone())).await {
                tracing::debug!(error = %e, "status edit failed");
              }
              last_edit = now;
              dirty = false;
            }
          }
          maybe = rx.recv() => {
            let Some(ev) = maybe else { break; };
            if progress.observe(&ev) {
              dirty = true;
              last_output = Instant::now();
            }
          }
        }
    }
    progress
}
