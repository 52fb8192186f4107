use ctb_core::relay::UserRequest;

use crate::router::AppState;

use super::{enqueue, RequestContext};

pub(super) async fn handle_text(state: &AppState, ctx: RequestContext, text: String) {
    if text.trim().is_empty() {
        return;
    }
    tracing::info!(user_id = ctx.user_id.0, chars = text.chars().count(), "text prompt");

    let relay = state.relay.clone();
    enqueue(state, ctx, async move {
        relay
            .handle(UserRequest {
                user_id: ctx.user_id,
                chat_id: ctx.chat_id,
                prompt: text,
            })
            .await;
    })
    .await;
}
