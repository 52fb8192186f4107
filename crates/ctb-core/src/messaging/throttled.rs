//! Outbound pacing for Telegram.
//!
//! One reply can turn into several chunks and document uploads with status
//! edits in between. Calls into one chat are kept about a second apart and all
//! calls share a global budget, which keeps long replies clear of 429s.

use std::{collections::HashMap, path::Path, sync::Arc, sync::Mutex, time::Duration};

use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Spacing between any two API calls.
    pub global_min_interval: Duration,
    /// Spacing between calls that post into the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Earliest free start time, globally and per chat.
#[derive(Debug)]
struct Slots {
    global_next: Instant,
    chat_next: HashMap<ChatId, Instant>,
}

impl Slots {
    fn new(now: Instant) -> Self {
        Self {
            global_next: now,
            chat_next: HashMap::new(),
        }
    }

    /// Book the next start time for a call into `chat` (or a chat-less call)
    /// and return how long the caller has to wait for it.
    fn book(&mut self, cfg: &ThrottleConfig, chat: Option<ChatId>, now: Instant) -> Duration {
        let mut start = self.global_next.max(now);
        if let Some(chat) = chat {
            if let Some(next) = self.chat_next.get(&chat) {
                start = start.max(*next);
            }
            self.chat_next.insert(chat, start + cfg.per_chat_min_interval);
        }
        self.global_next = start + cfg.global_min_interval;
        start.saturating_duration_since(now)
    }
}

/// [`MessagingPort`] decorator that spaces out outbound calls.
///
/// Typing indicators and callback answers only take a global slot; they do
/// not count against a chat's message budget.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    slots: Mutex<Slots>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            slots: Mutex::new(Slots::new(Instant::now())),
        }
    }

    async fn pace(&self, chat: Option<ChatId>) {
        let wait = match self.slots.lock() {
            Ok(mut slots) => slots.book(&self.cfg, chat, Instant::now()),
            Err(_) => Duration::ZERO,
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.pace(Some(chat_id)).await;
        self.inner.send_text(chat_id, text).await
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.pace(Some(chat_id)).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn edit_text(
        &self,
        msg: MessageRef,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        self.pace(Some(msg.chat_id)).await;
        self.inner.edit_text(msg, text, keyboard).await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.pace(Some(msg.chat_id)).await;
        self.inner.delete_message(msg).await
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.pace(None).await;
        self.inner.send_chat_action(chat_id, action).await
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.pace(Some(chat_id)).await;
        self.inner.send_inline_keyboard(chat_id, text, keyboard).await
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        self.pace(Some(chat_id)).await;
        self.inner.send_document(chat_id, path, caption).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.pace(None).await;
        self.inner.answer_callback_query(callback_id, text).await
    }
}
