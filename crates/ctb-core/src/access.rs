use crate::{errors::Error, Result};

// ============== Access filter ==============

/// Exact match of the sender's Telegram username against the one allowed
/// username. Anonymous senders (no username) never pass.
pub fn is_allowed(username: Option<&str>, allowed_username: &str) -> bool {
    let Some(username) = username else {
        return false;
    };
    if allowed_username.is_empty() {
        return false;
    }
    username == allowed_username
}

/// Same check as [`is_allowed`], as a `Result` for `?`-style call sites.
///
/// The error is meant for the log only; callers never echo it to the sender.
pub fn check_access(username: Option<&str>, allowed_username: &str) -> Result<()> {
    if is_allowed(username, allowed_username) {
        return Ok(());
    }
    Err(Error::AccessDenied(format!(
        "username {} is not allowed",
        username.map(|u| format!("@{u}")).unwrap_or_else(|| "<none>".to_string())
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_exact_username_is_allowed() {
        assert!(is_allowed(Some("alice"), "alice"));
        assert!(!is_allowed(Some("Alice"), "alice"));
        assert!(!is_allowed(Some("alice2"), "alice"));
        assert!(!is_allowed(Some("bob"), "alice"));
    }

    #[test]
    fn anonymous_and_empty_configuration_are_denied() {
        assert!(!is_allowed(None, "alice"));
        assert!(!is_allowed(Some(""), ""));
    }

    #[test]
    fn check_access_names_the_rejected_sender() {
        assert!(check_access(Some("alice"), "alice").is_ok());
        match check_access(Some("mallory"), "alice") {
            Err(Error::AccessDenied(msg)) => assert!(msg.contains("@mallory")),
            other => panic!("unexpected: {other:?}"),
        }
        match check_access(None, "alice") {
            Err(Error::AccessDenied(msg)) => assert!(msg.contains("<none>")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
