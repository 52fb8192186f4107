use std::sync::Arc;

use teloxide::{prelude::*, types::CallbackQuery};

use ctb_core::{
    approvals::{Choice, Resolution},
    domain::UserId,
    relay::parse_stop_callback,
};

use crate::router::AppState;

/// Answer text for a button press by `user_id`.
fn callback_answer(state: &AppState, user_id: UserId, data: &str) -> &'static str {
    if parse_stop_callback(data).is_some() {
        return stop_answer(state, user_id, data);
    }
    match state.relay.prompts().resolve(user_id, data) {
        Resolution::Resolved(Choice::Approve) => "Approved.",
        Resolution::Resolved(Choice::Deny) => "Denied.",
        Resolution::Resolved(Choice::Option(_)) => "Answer sent.",
        Resolution::NotYours => "That button is not yours.",
        Resolution::Expired => "This prompt has expired.",
        Resolution::Unknown => "Unknown action.",
    }
}

fn stop_answer(state: &AppState, user_id: UserId, data: &str) -> &'static str {
    match parse_stop_callback(data) {
        // Only the owner of a run can stop it.
        Some(target) if target == user_id => {
            if state.relay.active_runs().cancel(user_id) {
                tracing::info!(user_id = user_id.0, "stop requested from button");
                "Stopping…"
            } else {
                "Nothing to stop."
            }
        }
        Some(_) => "That button is not yours.",
        None => "Unknown action.",
    }
}

pub(super) async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    let user_id = UserId(q.from.id.0 as i64);
    let data = q.data.clone().unwrap_or_default();
    let answer = callback_answer(&state, user_id, &data);

    if let Err(e) = state
        .messenger
        .answer_callback_query(&q.id, Some(answer))
        .await
    {
        tracing::debug!(error = %e, "failed to answer callback query");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::state;
    use super::*;

    #[test]
    fn stop_button_answers() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = state(tmp.path());
        assert_eq!(stop_answer(&state, UserId(7), "stop:7"), "Nothing to stop.");
        assert_eq!(stop_answer(&state, UserId(7), "stop:8"), "That button is not yours.");
        assert_eq!(callback_answer(&state, UserId(7), "askuser:1:2"), "Unknown action.");
    }

    #[test]
    fn prompt_buttons_reach_the_relay() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = state(tmp.path());
        let (id, mut rx) = state.relay.prompts().open(UserId(7));

        assert_eq!(
            callback_answer(&state, UserId(8), &format!("perm:{id}:y")),
            "That button is not yours."
        );
        assert_eq!(callback_answer(&state, UserId(7), &format!("perm:{id}:y")), "Approved.");
        assert_eq!(rx.try_recv().unwrap(), Choice::Approve);
        assert_eq!(
            callback_answer(&state, UserId(7), &format!("perm:{id}:n")),
            "This prompt has expired."
        );
    }
}
