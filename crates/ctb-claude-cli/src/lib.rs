//! Claude CLI adapter.
//!
//! Runs `claude -p --output-format stream-json` as a subprocess in the user's
//! workspace and streams its NDJSON events back to the relay. Every run owns
//! its child process, so different users run concurrently up to the
//! configured limit.

use std::{collections::VecDeque, process::Stdio, sync::Arc};

use async_trait::async_trait;
use ctb_core::{
    errors::Error,
    formatting::{human_duration, truncate_text},
    model::{
        client::{ClaudeCliPromptAdapter, ModelClient},
        types::{
            ClaudeCliConfig, ModelEvent, PermissionDenial, RunRequest, RunResult, TokenUsage,
        },
    },
    Result,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{Mutex, Semaphore},
    time::{sleep, sleep_until, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const LINE_PREVIEW_CHARS: usize = 500;

#[derive(Clone, Debug)]
pub struct ClaudeCliClient {
    cfg: ClaudeCliConfig,
    permits: Arc<Semaphore>,
}

/// Last lines the CLI wrote to stderr, kept for error messages.
#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            match self.lines.pop_front() {
                Some(front) => self.bytes = self.bytes.saturating_sub(front.len() + 1),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Fields picked out of the stream as it goes by.
#[derive(Debug, Default)]
struct StreamState {
    result_text: Option<String>,
    is_error: Option<bool>,
    usage: Option<TokenUsage>,
    permission_denials: Vec<PermissionDenial>,
    assistant_parts: Vec<String>,
}

impl StreamState {
    fn observe(&mut self, ev: &ModelEvent) {
        match ev {
            ModelEvent::Assistant { .. } => {
                if let Some(text) = ev.assistant_text() {
                    self.assistant_parts.push(text);
                }
            }
            ModelEvent::Result { raw } => {
                if let Some(text) = raw.get("result").and_then(|v| v.as_str()) {
                    self.result_text = Some(text.to_string());
                }
                if let Some(is_error) = raw.get("is_error").and_then(|v| v.as_bool()) {
                    self.is_error = Some(is_error);
                }
                if let Some(usage) = raw.get("usage") {
                    self.usage = parse_usage(usage);
                }
                self.permission_denials = ev.permission_denials();
            }
            _ => {}
        }
    }

    /// Assistant text if any was streamed, else the final `result` field.
    fn text(&self) -> String {
        let streamed = self
            .assistant_parts
            .iter()
            .map(|s| s.trim_end())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        if streamed.is_empty() {
            self.result_text.clone().unwrap_or_default()
        } else {
            streamed
        }
    }
}

impl ClaudeCliClient {
    pub fn new(cfg: ClaudeCliConfig) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrent.max(1)));
        Self { cfg, permits }
    }

    pub fn config(&self) -> &ClaudeCliConfig {
        &self.cfg
    }
}

#[async_trait]
impl ModelClient for ClaudeCliClient {
    async fn run(
        &self,
        req: RunRequest,
        cancel: CancellationToken,
        on_event: &mut (dyn FnMut(ModelEvent) -> Result<()> + Send),
    ) -> Result<RunResult> {
        // Wait for a free slot; a stop while queued never starts the CLI.
        let _permit = tokio::select! {
          biased;
          _ = cancel.cancelled() => return Err(Error::Cancelled),
          permit = self.permits.clone().acquire_owned() => permit
            .map_err(|_| Error::Invocation("invocation limiter closed".to_string()))?,
        };

        let adapter = ClaudeCliPromptAdapter {
            cfg: self.cfg.clone(),
        };
        let inv = adapter.build_invocation(&req);
        tracing::debug!(
            program = %inv.program.display(),
            cwd = %inv.cwd.display(),
            session = %req.session_id,
            "spawning claude"
        );

        let mut child = Command::new(&inv.program)
            .args(&inv.args)
            .current_dir(&inv.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Invocation(format!(
                    "failed to start {}: {e}",
                    inv.program.display()
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Invocation("claude stdout was not captured".to_string()))?;
        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            });
        }

        let deadline = Instant::now() + self.cfg.query_timeout;
        let mut state = StreamState::default();
        let mut reader = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
              _ = cancel.cancelled() => {
                terminate(&mut child).await;
                tracing::info!(session = %req.session_id, "claude run cancelled");
                return Err(Error::Cancelled);
              }
              _ = sleep_until(deadline) => {
                terminate(&mut child).await;
                let head = format!("claude timed out after {}", human_duration(self.cfg.query_timeout));
                return Err(Error::Invocation(with_stderr(head, &stderr_tail).await));
              }
              _ = sleep(self.cfg.idle_timeout) => {
                terminate(&mut child).await;
                let head = format!("claude produced no output for {}", human_duration(self.cfg.idle_timeout));
                return Err(Error::Invocation(with_stderr(head, &stderr_tail).await));
              }
              line = reader.next_line() => {
                let line = match line {
                  Ok(v) => v,
                  Err(e) => {
                    terminate(&mut child).await;
                    return Err(Error::Invocation(format!("claude stdout read failed: {e}")));
                  }
                };
                let Some(line) = line else { break; };
                if line.trim().is_empty() {
                  continue;
                }

                // The CLI sometimes prints banners or warnings between events.
                let value: serde_json::Value = match serde_json::from_str(&line) {
                  Ok(v) => v,
                  Err(e) => {
                    tracing::warn!(
                      error = %e,
                      line = %truncate_text(&line, LINE_PREVIEW_CHARS),
                      "skipping non-JSON stdout line"
                    );
                    continue;
                  }
                };

                let ev = ModelEvent::classify(value);
                state.observe(&ev);
                if let Err(e) = on_event(ev) {
                  terminate(&mut child).await;
                  return Err(e);
                }
              }
            }
        }

        let status = match timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                terminate(&mut child).await;
                return Err(Error::Invocation(
                    "claude closed its output but did not exit".to_string(),
                ));
            }
        };

        if let Some(usage) = &state.usage {
            tracing::info!(
                session = %req.session_id,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                cache_read_tokens = usage.cache_read_input_tokens,
                "claude run finished"
            );
        }

        if !status.success() {
            let head = match (&state.result_text, state.is_error) {
                (Some(text), Some(true)) if !text.trim().is_empty() => {
                    format!("claude exited with {status}: {text}")
                }
                _ => format!("claude exited with {status}"),
            };
            return Err(Error::Invocation(with_stderr(head, &stderr_tail).await));
        }

        let is_error = state.is_error.unwrap_or(false);
        let text = if is_error {
            state.result_text.clone().unwrap_or_default()
        } else {
            state.text()
        };
        Ok(RunResult {
            is_error,
            text,
            usage: state.usage,
            permission_denials: state.permission_denials,
        })
    }
}

async fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill claude process");
    }
}

async fn with_stderr(head: String, tail: &Mutex<StderrTail>) -> String {
    let stderr = tail.lock().await.snapshot();
    if stderr.trim().is_empty() {
        head
    } else {
        format!("{head}\nstderr (tail):\n{stderr}")
    }
}

fn parse_usage(v: &serde_json::Value) -> Option<TokenUsage> {
    if !v.is_object() {
        return None;
    }
    let get = |k: &str| v.get(k).and_then(|x| x.as_u64()).unwrap_or(0);
    Some(TokenUsage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_read_input_tokens: get("cache_read_input_tokens"),
        cache_creation_input_tokens: get("cache_creation_input_tokens"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctb_core::{
        domain::SessionId,
        model::types::{PermissionMode, SessionMode},
    };
    use std::{
        path::{Path, PathBuf},
        time::Duration,
    };

    // Scripts are written then executed; serialize so no other test forks while
    // a script file is still open for writing (ETXTBSY).
    static SCRIPT_LOCK: Mutex<()> = Mutex::const_new(());

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn client(claude_path: PathBuf, idle: Duration, max_concurrent: usize) -> ClaudeCliClient {
        ClaudeCliClient::new(ClaudeCliConfig {
            claude_path,
            model: Some("sonnet".to_string()),
            permission_mode: PermissionMode::BypassPermissions,
            allowed_tools: vec![],
            query_timeout: Duration::from_secs(30),
            idle_timeout: idle,
            max_concurrent,
        })
    }

    fn request(cwd: &Path, prompt: &str) -> RunRequest {
        RunRequest {
            prompt: prompt.to_string(),
            cwd: cwd.to_path_buf(),
            session_id: SessionId("11111111-2222-3333-4444-555555555555".to_string()),
            session_mode: SessionMode::Create,
            allowed_tools: vec![],
        }
    }

    const HAPPY: &str = r#"printf '%s\n' "$@" > args.txt
echo '{"type":"system","subtype":"init","session_id":"abc"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"4"}]}}'
echo '{"type":"result","result":"4","is_error":false,"session_id":"abc","usage":{"input_tokens":3,"output_tokens":1}}'"#;

    #[test]
    fn stderr_tail_keeps_the_last_lines() {
        let mut tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_MAX_LINES + 5) {
            tail.push_line(format!("line {i}"));
        }
        let snap = tail.snapshot();
        assert!(snap.starts_with("line 5\n"));
        assert!(snap.ends_with(&format!("line {}", STDERR_TAIL_MAX_LINES + 4)));
    }

    #[test]
    fn stream_state_prefers_streamed_text() {
        let mut s = StreamState::default();
        s.observe(&ModelEvent::classify(serde_json::json!({"type": "system", "session_id": "x"})));
        s.observe(&ModelEvent::classify(serde_json::json!({
            "type": "assistant", "message": {"content": [{"type": "text", "text": "one"}]}
        })));
        s.observe(&ModelEvent::classify(serde_json::json!({
            "type": "assistant", "message": {"content": [{"type": "text", "text": "two"}]}
        })));
        s.observe(&ModelEvent::classify(serde_json::json!({"type": "result", "result": "two"})));
        assert_eq!(s.text(), "one\n\ntwo");

        let mut only_result = StreamState::default();
        only_result.observe(&ModelEvent::classify(serde_json::json!({"type": "result", "result": "done"})));
        assert_eq!(only_result.text(), "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_events_and_returns_result() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let script = write_script(tmp.path(), HAPPY);

        let mut events = Vec::new();
        let mut on_event = |ev: ModelEvent| -> Result<()> {
            events.push(ev);
            Ok(())
        };
        let res = client(script, Duration::from_secs(10), 2)
            .run(request(&ws, "-2+2?"), CancellationToken::new(), &mut on_event)
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ModelEvent::SystemInit { .. }));
        assert_eq!(res.text, "4");
        assert!(!res.is_error);
        assert_eq!(res.usage.unwrap().input_tokens, 3);

        // Ran inside the workspace, with the prompt after `--`.
        let args = std::fs::read_to_string(ws.join("args.txt")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(&args[args.len() - 2..], &["--", "-2+2?"]);
        assert!(args.contains(&"--session-id"));
        assert!(args.contains(&"sonnet"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_invocation_error_with_stderr() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "echo 'session not found' >&2\nexit 3");

        let mut on_event = |_: ModelEvent| -> Result<()> { Ok(()) };
        let err = client(script, Duration::from_secs(10), 1)
            .run(request(tmp.path(), "hi"), CancellationToken::new(), &mut on_event)
            .await
            .unwrap_err();

        let Error::Invocation(msg) = err else {
            panic!("expected invocation error, got {err:?}")
        };
        assert!(msg.contains("claude exited with"), "{msg}");
        // stderr is drained concurrently; it may or may not be in the tail yet.
        assert!(!msg.contains("stdout line"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_result_is_reported_as_is_error() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            r#"echo '{"type":"result","result":"Prompt is too long","is_error":true}'"#,
        );

        let mut on_event = |_: ModelEvent| -> Result<()> { Ok(()) };
        let res = client(script, Duration::from_secs(10), 1)
            .run(request(tmp.path(), "hi"), CancellationToken::new(), &mut on_event)
            .await
            .unwrap();
        assert!(res.is_error);
        assert_eq!(res.text, "Prompt is too long");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            r#"echo '{"type":"system","session_id":"abc"}'
exec sleep 30"#,
        );

        let token = CancellationToken::new();
        let stopper = token.clone();
        let mut on_event = move |_: ModelEvent| -> Result<()> {
            stopper.cancel();
            Ok(())
        };
        let started = std::time::Instant::now();
        let err = client(script, Duration::from_secs(60), 1)
            .run(request(tmp.path(), "hi"), token, &mut on_event)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idle_timeout_stops_a_silent_process() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "exec sleep 30");

        let mut on_event = |_: ModelEvent| -> Result<()> { Ok(()) };
        let err = client(script, Duration::from_millis(300), 1)
            .run(request(tmp.path(), "hi"), CancellationToken::new(), &mut on_event)
            .await
            .unwrap_err();
        let Error::Invocation(msg) = err else {
            panic!("expected invocation error, got {err:?}")
        };
        assert!(msg.starts_with("claude produced no output"), "{msg}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stray_stdout_lines_are_skipped() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            r#"echo 'Warning: update available'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"4"}]}}'
echo '{"type":"result","result":"4","is_error":false}'
exit 0"#,
        );

        let mut seen = 0;
        let mut on_event = |_: ModelEvent| -> Result<()> {
            seen += 1;
            Ok(())
        };
        let res = client(script, Duration::from_secs(10), 1)
            .run(request(tmp.path(), "2+2?"), CancellationToken::new(), &mut on_event)
            .await
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(res.text, "4");
        assert!(!res.is_error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permission_denials_are_returned_with_the_result() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            r#"echo '{"type":"result","result":"I need approval to run ls.","is_error":false,"permission_denials":[{"tool_name":"Bash","tool_use_id":"t1","tool_input":{"command":"ls"}}]}'"#,
        );

        let mut on_event = |_: ModelEvent| -> Result<()> { Ok(()) };
        let res = client(script, Duration::from_secs(10), 1)
            .run(request(tmp.path(), "list files"), CancellationToken::new(), &mut on_event)
            .await
            .unwrap();
        assert_eq!(res.permission_denials.len(), 1);
        assert_eq!(res.permission_denials[0].tool_name, "Bash");
        assert_eq!(res.text, "I need approval to run ls.");
    }

    #[tokio::test]
    async fn missing_binary_is_an_invocation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut on_event = |_: ModelEvent| -> Result<()> { Ok(()) };
        let err = client(tmp.path().join("no-such-claude"), Duration::from_secs(1), 1)
            .run(request(tmp.path(), "hi"), CancellationToken::new(), &mut on_event)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invocation(ref m) if m.starts_with("failed to start")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn different_users_run_concurrently() {
        let _guard = SCRIPT_LOCK.lock().await;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            r#"sleep 1
echo '{"type":"result","result":"ok","is_error":false}'"#,
        );
        let ws_a = tmp.path().join("user_1");
        let ws_b = tmp.path().join("user_2");
        std::fs::create_dir_all(&ws_a).unwrap();
        std::fs::create_dir_all(&ws_b).unwrap();

        let cli = client(script, Duration::from_secs(10), 2);
        let mut ev_a = |_: ModelEvent| -> Result<()> { Ok(()) };
        let mut ev_b = |_: ModelEvent| -> Result<()> { Ok(()) };
        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            cli.run(request(&ws_a, "a"), CancellationToken::new(), &mut ev_a),
            cli.run(request(&ws_b, "b"), CancellationToken::new(), &mut ev_b),
        );
        assert_eq!(a.unwrap().text, "ok");
        assert_eq!(b.unwrap().text, "ok");
        assert!(started.elapsed() < Duration::from_millis(1900));
    }
}
