//! Per-user session store.
//!
//! Each user has one record at `<sessions_dir>/user_<id>.json` holding the
//! active Claude CLI session plus a short history of earlier ones. Expiry is
//! lazy: a session past its timeout is replaced the next time it is looked up.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::user_dir_name,
    domain::{SessionId, UserId},
    errors::Error,
    locks::KeyedLocks,
    model::types::SessionMode,
    Result,
};

/// How many earlier sessions are remembered per user for `/switch`.
pub const MAX_SESSION_HISTORY: usize = 20;

const PREVIEW_CHARS: usize = 60;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Successful exchanges under this id. Zero means the CLI has never seen it.
    #[serde(default)]
    pub turns: u32,
    /// Start of the first prompt, shown in `/sessions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Tools the user approved from a permission prompt; kept for later runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approved_tools: Vec<String>,
}

impl SessionEntry {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            session_id: SessionId::generate(),
            created_at: now,
            last_activity: now,
            turns: 0,
            preview: None,
            approved_tools: Vec::new(),
        }
    }

    pub fn is_expired_at(&self, timeout: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(timeout) = timeout else {
            return false;
        };
        match (now - self.last_activity).to_std() {
            Ok(idle) => idle > timeout,
            // last_activity in the future (clock moved back): not expired.
            Err(_) => false,
        }
    }

    pub fn session_mode(&self) -> SessionMode {
        if self.turns == 0 {
            SessionMode::Create
        } else {
            SessionMode::Resume
        }
    }
}

/// On-disk record for one user.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserSessions {
    pub user_id: i64,
    #[serde(default)]
    pub active: Option<SessionEntry>,
    /// Earlier sessions, newest first.
    #[serde(default)]
    pub history: Vec<SessionEntry>,
}

impl UserSessions {
    fn retire_active(&mut self) {
        if let Some(old) = self.active.take() {
            self.history.insert(0, old);
            self.history.truncate(MAX_SESSION_HISTORY);
        }
    }

    fn entry_mut(&mut self, id: &SessionId) -> Option<&mut SessionEntry> {
        self.active
            .iter_mut()
            .chain(self.history.iter_mut())
            .find(|e| &e.session_id == id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SwitchOutcome {
    Switched(SessionEntry),
    NotFound,
    Ambiguous(usize),
}

pub struct SessionStore {
    dir: PathBuf,
    timeout: Option<Duration>,
    locks: KeyedLocks<UserId>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            locks: KeyedLocks::new(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn record_path(&self, user_id: UserId) -> PathBuf {
        self.dir.join(format!("{}.json", user_dir_name(user_id)))
    }

    pub async fn get_or_create(&self, user_id: UserId) -> Result<SessionEntry> {
        self.get_or_create_at(user_id, Utc::now()).await
    }

    /// Active non-expired session, or a freshly allocated one (persisted).
    pub async fn get_or_create_at(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<SessionEntry> {
        let _guard = self.locks.lock(&user_id).await;
        let mut record = self.load(user_id);

        match self.lookup(&record, now) {
            Ok(Some(entry)) => return Ok(entry),
            Ok(None) => {}
            Err(Error::SessionExpired(old)) => {
                tracing::info!(user_id = user_id.0, old_session = %old, "session expired, starting a new one");
                record.retire_active();
            }
            Err(e) => return Err(e),
        }

        let entry = SessionEntry::fresh(now);
        record.active = Some(entry.clone());
        self.save(user_id, &record)?;
        tracing::info!(user_id = user_id.0, session = %entry.session_id, "allocated session");
        Ok(entry)
    }

    fn lookup(&self, record: &UserSessions, now: DateTime<Utc>) -> Result<Option<SessionEntry>> {
        match &record.active {
            None => Ok(None),
            Some(e) if e.is_expired_at(self.timeout, now) => {
                Err(Error::SessionExpired(e.session_id.to_string()))
            }
            Some(e) => Ok(Some(e.clone())),
        }
    }

    pub async fn reset(&self, user_id: UserId) -> Result<SessionId> {
        self.reset_at(user_id, Utc::now()).await
    }

    /// Unconditionally allocate a new session; the old one moves to history.
    pub async fn reset_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<SessionId> {
        let _guard = self.locks.lock(&user_id).await;
        let mut record = self.load(user_id);
        let previous = record.active.as_ref().map(|e| e.session_id.clone());
        record.retire_active();

        let mut entry = SessionEntry::fresh(now);
        while Some(&entry.session_id) == previous.as_ref() {
            entry = SessionEntry::fresh(now);
        }
        let id = entry.session_id.clone();
        record.active = Some(entry);
        self.save(user_id, &record)?;
        tracing::info!(user_id = user_id.0, session = %id, previous = ?previous.map(|p| p.0), "session reset");
        Ok(id)
    }

    pub async fn touch(&self, user_id: UserId, id: &SessionId, prompt: &str) -> Result<()> {
        self.touch_at(user_id, id, prompt, Utc::now()).await
    }

    /// Record a successful exchange on `id`.
    ///
    /// Only that entry changes; if a `/reset` happened meanwhile, the new
    /// session stays active.
    pub async fn touch_at(
        &self,
        user_id: UserId,
        id: &SessionId,
        prompt: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.locks.lock(&user_id).await;
        let mut record = self.load(user_id);
        let Some(entry) = record.entry_mut(id) else {
            tracing::debug!(user_id = user_id.0, session = %id, "touch for unknown session ignored");
            return Ok(());
        };
        entry.last_activity = now;
        entry.turns = entry.turns.saturating_add(1);
        if entry.preview.is_none() {
            entry.preview = preview_of(prompt);
        }
        self.save(user_id, &record)
    }

    /// Remember `tools` as approved for session `id`. Returns the full list.
    pub async fn approve_tools(
        &self,
        user_id: UserId,
        id: &SessionId,
        tools: &[String],
    ) -> Result<Vec<String>> {
        let _guard = self.locks.lock(&user_id).await;
        let mut record = self.load(user_id);
        let Some(entry) = record.entry_mut(id) else {
            return Ok(tools.to_vec());
        };
        for tool in tools {
            if !entry.approved_tools.contains(tool) {
                entry.approved_tools.push(tool.clone());
            }
        }
        let approved = entry.approved_tools.clone();
        self.save(user_id, &record)?;
        tracing::info!(user_id = user_id.0, session = %id, tools = ?tools, "tools approved");
        Ok(approved)
    }

    /// Current record without creating or expiring anything.
    pub async fn list(&self, user_id: UserId) -> UserSessions {
        let _guard = self.locks.lock(&user_id).await;
        self.load(user_id)
    }

    pub async fn switch(&self, user_id: UserId, id_prefix: &str) -> Result<SwitchOutcome> {
        self.switch_at(user_id, id_prefix, Utc::now()).await
    }

    /// Make an earlier session active again, matched by id prefix.
    pub async fn switch_at(
        &self,
        user_id: UserId,
        id_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<SwitchOutcome> {
        let prefix = id_prefix.trim();
        if prefix.is_empty() {
            return Ok(SwitchOutcome::NotFound);
        }

        let _guard = self.locks.lock(&user_id).await;
        let mut record = self.load(user_id);

        if let Some(active) = record.active.as_mut() {
            if active.session_id.as_str().starts_with(prefix) {
                active.last_activity = now;
                let entry = active.clone();
                self.save(user_id, &record)?;
                return Ok(SwitchOutcome::Switched(entry));
            }
        }

        let matches: Vec<usize> = record
            .history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.session_id.as_str().starts_with(prefix))
            .map(|(i, _)| i)
            .collect();
        let idx = match matches.as_slice() {
            [] => return Ok(SwitchOutcome::NotFound),
            [i] => *i,
            many => return Ok(SwitchOutcome::Ambiguous(many.len())),
        };

        let mut entry = record.history.remove(idx);
        entry.last_activity = now;
        record.retire_active();
        record.active = Some(entry.clone());
        self.save(user_id, &record)?;
        tracing::info!(user_id = user_id.0, session = %entry.session_id, "switched session");
        Ok(SwitchOutcome::Switched(entry))
    }

    fn load(&self, user_id: UserId) -> UserSessions {
        let path = self.record_path(user_id);
        match load_record(&path) {
            Ok(Some(record)) => record,
            Ok(None) => UserSessions {
                user_id: user_id.0,
                ..Default::default()
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable session record, starting fresh");
                UserSessions {
                    user_id: user_id.0,
                    ..Default::default()
                }
            }
        }
    }

    fn save(&self, user_id: UserId, record: &UserSessions) -> Result<()> {
        save_record(&self.record_path(user_id), record)
    }
}

fn preview_of(prompt: &str) -> Option<String> {
    let line = prompt.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut out: String = line.chars().take(PREVIEW_CHARS).collect();
    if line.chars().count() > PREVIEW_CHARS {
        out.push('…');
    }
    Some(out)
}

fn load_record(path: &Path) -> Result<Option<UserSessions>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    let data: UserSessions = serde_json::from_str(&txt)?;
    Ok(Some(data))
}

fn save_record(path: &Path, data: &UserSessions) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let txt = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, txt)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
