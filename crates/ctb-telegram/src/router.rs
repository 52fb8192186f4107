use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use ctb_core::{
    config::Config,
    media::MediaStore,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    model::client::ModelClient,
    relay::Relay,
    session::SessionStore,
};

use crate::handlers;
use crate::queue::UserQueues;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub relay: Arc<Relay>,
    pub messenger: Arc<dyn MessagingPort>,
    pub queues: Arc<UserQueues>,
}

impl AppState {
    pub fn new(
        cfg: Arc<Config>,
        model: Arc<dyn ModelClient>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(cfg.sessions_dir(), cfg.session_timeout));
        let media = MediaStore::new(cfg.media_dir());
        let relay = Arc::new(Relay::new(
            cfg.clone(),
            sessions,
            media,
            model,
            messenger.clone(),
        ));
        Self {
            cfg,
            relay,
            messenger,
            queues: Arc::new(UserQueues::new()),
        }
    }
}

pub async fn run_polling(cfg: Arc<Config>, model: Arc<dyn ModelClient>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => tracing::info!(bot = %me.username(), "connected to telegram"),
        Err(e) => tracing::warn!(error = %e, "get_me failed; polling anyway"),
    }
    tracing::info!(
        allowed_username = %cfg.allowed_username,
        workspace_dir = %cfg.workspace_dir.display(),
        data_dir = %cfg.data_dir.display(),
        "accepting messages"
    );

    // Throttle outbound calls to stay clear of Telegram's 429s during streaming;
    // the adapter still honours RetryAfter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let state = Arc::new(AppState::new(cfg, model, messenger));

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    tracing::info!("dispatcher stopped");
    Ok(())
}
