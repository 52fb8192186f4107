//! Telegram update handlers.
//!
//! Each handler is a small adapter that:
//! - applies the access filter (other users are dropped without a reply)
//! - runs `/stop` and read-only commands inline, `/reset` and `/switch` on
//!   the user's lane
//! - downloads media if needed and queues a prompt on the user's lane

use std::{future::Future, sync::Arc};

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use ctb_core::{
    access::check_access,
    domain::{ChatId, UserId},
};

use crate::router::AppState;

mod callback;
mod commands;
mod media;
mod text;

pub use commands::{parse_command, Command};

/// Who sent an update and where replies go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
    pub chat_id: ChatId,
}

/// `true` when `username` may use the bot; logs the drop otherwise.
fn admit(state: &AppState, user_id: u64, username: Option<&str>, what: &str) -> bool {
    match check_access(username, &state.cfg.allowed_username) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(user_id, update = what, reason = %e, "dropping update");
            false
        }
    }
}

pub async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    if !admit(&state, q.from.id.0, q.from.username.as_deref(), "callback") {
        return Ok(());
    }
    callback::handle_callback(q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    if !admit(&state, user.id.0, user.username.as_deref(), "message") {
        return Ok(());
    }

    let ctx = RequestContext {
        user_id: UserId(user.id.0 as i64),
        chat_id: ChatId(msg.chat.id.0),
    };

    if let Some(text) = msg.text() {
        // Unknown slash commands belong to Claude.
        if let Some(cmd) = parse_command(text) {
            commands::dispatch(&state, ctx, cmd).await;
            return Ok(());
        }
        text::handle_text(&state, ctx, text.to_string()).await;
        return Ok(());
    }

    if let Some(attachment) = media::Attachment::from_message(&msg) {
        media::handle_attachment(bot, &state, ctx, attachment).await;
        return Ok(());
    }

    tracing::debug!(user_id = ctx.user_id.0, "unsupported message kind");
    let _ = state
        .messenger
        .send_text(
            ctx.chat_id,
            "Sorry, I can only handle text, photos and documents.",
        )
        .await;
    Ok(())
}

/// Put work on the user's lane, telling them when it has to wait.
async fn enqueue<F>(state: &AppState, ctx: RequestContext, job: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let ahead = state.queues.enqueue(ctx.user_id, job);
    if ahead > 0 {
        tracing::info!(user_id = ctx.user_id.0, ahead, "request queued");
        let note = format!("⏳ Queued behind {ahead} earlier request(s).");
        let _ = state.messenger.send_text(ctx.chat_id, &note).await;
    }
}
