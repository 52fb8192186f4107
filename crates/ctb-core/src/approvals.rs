//! Button prompts raised while a request runs: tool approvals and questions
//! Claude asks through `AskUserQuestion`.
//!
//! Claude runs headless, so a tool it was not allowed to use comes back as a
//! `permission_denials` entry on the result. The relay turns those into
//! buttons, waits for the press through [`PendingPrompts`], and resumes the
//! session with the approved tools.

use std::{collections::HashMap, sync::Mutex};

use tokio::sync::oneshot;

use crate::{
    domain::UserId,
    formatting::truncate_text,
    messaging::types::{InlineButton, InlineKeyboard},
    model::types::PermissionDenial,
};

/// Approval rounds per request before the last reply is kept as is.
pub const MAX_PERMISSION_ROUNDS: usize = 5;

pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// Read-only tools allowed without asking when permissions are enforced.
pub const SAFE_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Task", "TaskOutput"];

/// Bookkeeping tools granted on retry without a prompt.
pub const AUTO_APPROVED_TOOLS: &[&str] = &[
    "EnterPlanMode",
    "ExitPlanMode",
    "TodoWrite",
    "TaskCreate",
    "TaskUpdate",
    "TaskList",
    "TaskGet",
];

const PERMISSION_PREFIX: &str = "perm:";
const ANSWER_PREFIX: &str = "ask:";
const MAX_INPUT_CHARS: usize = 500;
const MAX_PROMPT_CHARS: usize = 3500;
const MAX_LABEL_CHARS: usize = 40;

/// A button press on an open prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Choice {
    Approve,
    Deny,
    Option(usize),
}

/// What happened to a button press.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Choice),
    /// The prompt belongs to another user.
    NotYours,
    /// The prompt was answered, timed out, or its request ended.
    Expired,
    /// Not prompt callback data.
    Unknown,
}

struct Pending {
    user_id: UserId,
    reply: oneshot::Sender<Choice>,
}

/// Open prompts, keyed by a short id carried in the callback data.
#[derive(Default)]
pub struct PendingPrompts {
    inner: Mutex<HashMap<String, Pending>>,
}

impl PendingPrompts {
    /// Open a prompt for `user_id`. The receiver yields the first valid press.
    pub fn open(&self, user_id: UserId) -> (String, oneshot::Receiver<Choice>) {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let (reply, rx) = oneshot::channel();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id.clone(), Pending { user_id, reply });
        }
        (id, rx)
    }

    pub fn close(&self, id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(id);
        }
    }

    /// Route callback data from `user_id` to its prompt.
    pub fn resolve(&self, user_id: UserId, data: &str) -> Resolution {
        let Some((id, choice)) = parse_callback(data) else {
            return Resolution::Unknown;
        };
        let Ok(mut map) = self.inner.lock() else {
            return Resolution::Expired;
        };
        match map.get(id) {
            None => return Resolution::Expired,
            Some(p) if p.user_id != user_id => return Resolution::NotYours,
            Some(_) => {}
        }
        let Some(pending) = map.remove(id) else {
            return Resolution::Expired;
        };
        match pending.reply.send(choice) {
            Ok(()) => Resolution::Resolved(choice),
            Err(_) => Resolution::Expired,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|m| m.is_empty()).unwrap_or(true)
    }
}

fn parse_callback(data: &str) -> Option<(&str, Choice)> {
    if let Some(rest) = data.strip_prefix(PERMISSION_PREFIX) {
        let (id, verdict) = rest.split_once(':')?;
        let choice = match verdict {
            "y" => Choice::Approve,
            "n" => Choice::Deny,
            _ => return None,
        };
        return Some((id, choice));
    }
    let rest = data.strip_prefix(ANSWER_PREFIX)?;
    let (id, idx) = rest.split_once(':')?;
    Some((id, Choice::Option(idx.parse().ok()?)))
}

pub fn approval_keyboard(id: &str) -> InlineKeyboard {
    InlineKeyboard::new(vec![
        InlineButton {
            label: "✅ Approve all".to_string(),
            callback_data: format!("{PERMISSION_PREFIX}{id}:y"),
        },
        InlineButton {
            label: "❌ Deny".to_string(),
            callback_data: format!("{PERMISSION_PREFIX}{id}:n"),
        },
    ])
}

pub fn question_keyboard(id: &str, options: &[String]) -> InlineKeyboard {
    let buttons = options
        .iter()
        .enumerate()
        .map(|(idx, label)| InlineButton {
            label: truncate_text(label, MAX_LABEL_CHARS),
            callback_data: format!("{ANSWER_PREFIX}{id}:{idx}"),
        })
        .collect();
    InlineKeyboard::new(buttons)
}

/// Denials of one result, grouped by how they are handled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DenialPlan {
    /// One entry per tool that needs the user's approval.
    pub needs_approval: Vec<PermissionDenial>,
    pub auto_approved: Vec<String>,
    /// Input of the first `AskUserQuestion` call.
    pub question: Option<serde_json::Value>,
}

impl DenialPlan {
    pub fn from_denials(denials: &[PermissionDenial]) -> Self {
        let mut plan = Self::default();
        for d in denials {
            if d.tool_name == ASK_USER_TOOL {
                if plan.question.is_none() {
                    plan.question = Some(d.tool_input.clone());
                }
            } else if AUTO_APPROVED_TOOLS.contains(&d.tool_name.as_str()) {
                if !plan.auto_approved.contains(&d.tool_name) {
                    plan.auto_approved.push(d.tool_name.clone());
                }
            } else if !plan
                .needs_approval
                .iter()
                .any(|p| p.tool_name == d.tool_name)
            {
                plan.needs_approval.push(d.clone());
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.needs_approval.is_empty() && self.auto_approved.is_empty() && self.question.is_none()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.needs_approval
            .iter()
            .map(|d| d.tool_name.clone())
            .collect()
    }
}

/// One-line description of a denied tool call.
pub fn describe_tool(name: &str, input: &serde_json::Value) -> String {
    let field = |k: &str| input.get(k).and_then(|v| v.as_str());
    match name {
        "Bash" => {
            let command = truncate_text(field("command").unwrap_or(""), MAX_INPUT_CHARS);
            match field("description") {
                Some(d) if !d.trim().is_empty() => format!("Bash: {command}\n  ({d})"),
                _ => format!("Bash: {command}"),
            }
        }
        "Write" | "Edit" | "Read" => {
            format!("{name}: {}", field("file_path").unwrap_or("(unknown file)"))
        }
        _ if input.is_null() => name.to_string(),
        _ => format!(
            "{name}: {}",
            truncate_text(&input.to_string(), MAX_INPUT_CHARS)
        ),
    }
}

pub fn permission_request_text(denials: &[PermissionDenial]) -> String {
    let mut out = String::from("🔐 Claude wants to use:\n");
    for d in denials {
        out.push_str("\n• ");
        out.push_str(&describe_tool(&d.tool_name, &d.tool_input));
    }
    out.push_str("\n\nApproved tools stay allowed for this session.");
    truncate_text(&out, MAX_PROMPT_CHARS)
}

/// One question from an `AskUserQuestion` call.
#[derive(Clone, Debug, PartialEq)]
pub struct Question {
    pub header: Option<String>,
    pub text: String,
    pub options: Vec<String>,
}

impl Question {
    pub fn prompt_text(&self) -> String {
        match &self.header {
            Some(h) => format!("❓ {h}\n\n{}", self.text),
            None => format!("❓ {}", self.text),
        }
    }
}

pub fn parse_questions(input: &serde_json::Value) -> Vec<Question> {
    let Some(items) = input.get("questions").and_then(|q| q.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|q| {
            let text = q.get("question")?.as_str()?.trim().to_string();
            if text.is_empty() {
                return None;
            }
            let header = q
                .get("header")
                .and_then(|h| h.as_str())
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string);
            let options = q
                .get("options")
                .and_then(|o| o.as_array())
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| {
                            o.get("label")
                                .and_then(|l| l.as_str())
                                .or_else(|| o.as_str())
                                .map(str::to_string)
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(Question {
                header,
                text,
                options,
            })
        })
        .collect()
}

/// Prompt text that hands the user's answers back to Claude.
pub fn answers_text(questions: &[Question], answers: &[Option<String>]) -> String {
    let answered: Vec<String> = questions
        .iter()
        .zip(answers)
        .filter_map(|(q, a)| a.as_ref().map(|a| format!("Q: {}\nA: {a}", q.text)))
        .collect();
    if answered.is_empty() {
        "The user did not answer your questions. Continue without their answers.".to_string()
    } else {
        format!("The user answered your questions:\n\n{}", answered.join("\n\n"))
    }
}

/// Prompt for the resumed run after a prompt round.
pub fn continue_prompt(granted: bool, answers: Option<&str>) -> String {
    match (granted, answers) {
        (true, Some(a)) => format!("Permissions granted.\n\n{a}"),
        (_, Some(a)) => a.to_string(),
        (_, None) => "Permissions granted, try again.".to_string(),
    }
}

/// Later reply appended to the earlier one; an empty retry keeps the earlier.
pub fn join_replies(earlier: String, later: String) -> String {
    if later.trim().is_empty() {
        earlier
    } else if earlier.trim().is_empty() {
        later
    } else {
        format!("{}\n\n{}", earlier.trim_end(), later)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn denial(tool: &str, input: serde_json::Value) -> PermissionDenial {
        PermissionDenial {
            tool_name: tool.to_string(),
            tool_input: input,
        }
    }

    #[tokio::test]
    async fn a_press_reaches_the_waiting_prompt_once() {
        let prompts = PendingPrompts::default();
        let (id, rx) = prompts.open(UserId(1));

        assert_eq!(
            prompts.resolve(UserId(2), &format!("perm:{id}:y")),
            Resolution::NotYours
        );
        assert_eq!(
            prompts.resolve(UserId(1), &format!("perm:{id}:n")),
            Resolution::Resolved(Choice::Deny)
        );
        assert_eq!(rx.await.unwrap(), Choice::Deny);
        assert_eq!(
            prompts.resolve(UserId(1), &format!("perm:{id}:y")),
            Resolution::Expired
        );
        assert!(prompts.is_empty());
    }

    #[test]
    fn closed_prompts_and_foreign_data_are_not_routed() {
        let prompts = PendingPrompts::default();
        let (id, _rx) = prompts.open(UserId(1));
        prompts.close(&id);
        assert_eq!(
            prompts.resolve(UserId(1), &format!("ask:{id}:0")),
            Resolution::Expired
        );
        assert_eq!(prompts.resolve(UserId(1), "stop:1"), Resolution::Unknown);
        assert_eq!(prompts.resolve(UserId(1), "perm:abc:maybe"), Resolution::Unknown);
        assert_eq!(prompts.resolve(UserId(1), "ask:abc:x"), Resolution::Unknown);
    }

    #[test]
    fn keyboards_carry_the_prompt_id() {
        let kb = approval_keyboard("ab12cd34");
        assert_eq!(kb.buttons[0].callback_data, "perm:ab12cd34:y");
        assert_eq!(kb.buttons[1].callback_data, "perm:ab12cd34:n");

        let long = "x".repeat(60);
        let kb = question_keyboard("q1", &["Yes".to_string(), long]);
        assert_eq!(kb.buttons[1].callback_data, "ask:q1:1");
        assert_eq!(kb.buttons[1].label.chars().count(), MAX_LABEL_CHARS + 1);
        assert_eq!(parse_callback("ask:q1:1"), Some(("q1", Choice::Option(1))));
    }

    #[test]
    fn denials_are_grouped_by_handling() {
        let plan = DenialPlan::from_denials(&[
            denial("Bash", json!({"command": "rm -rf build"})),
            denial("Bash", json!({"command": "ls"})),
            denial("TodoWrite", json!({})),
            denial(ASK_USER_TOOL, json!({"questions": []})),
            denial("Write", json!({"file_path": "a.txt"})),
        ]);
        assert_eq!(plan.tool_names(), vec!["Bash", "Write"]);
        assert_eq!(
            plan.needs_approval[0].tool_input,
            json!({"command": "rm -rf build"})
        );
        assert_eq!(plan.auto_approved, vec!["TodoWrite"]);
        assert!(plan.question.is_some());
        assert!(DenialPlan::from_denials(&[]).is_empty());
    }

    #[test]
    fn tool_descriptions_show_the_relevant_input() {
        assert_eq!(
            describe_tool("Bash", &json!({"command": "make", "description": "Build"})),
            "Bash: make\n  (Build)"
        );
        assert_eq!(
            describe_tool("Edit", &json!({"file_path": "src/main.rs"})),
            "Edit: src/main.rs"
        );
        assert_eq!(
            describe_tool("WebFetch", &json!({"url": "https://x"})),
            "WebFetch: {\"url\":\"https://x\"}"
        );
        let text = permission_request_text(&[denial("Write", json!({"file_path": "a.txt"}))]);
        assert!(text.contains("• Write: a.txt"), "{text}");
    }

    #[test]
    fn questions_and_answers_become_a_prompt() {
        let questions = parse_questions(&json!({"questions": [
            {"question": "Which language?", "header": "Lang",
             "options": [{"label": "Rust"}, {"label": "Go"}], "multiSelect": false},
            {"question": "  "},
            {"question": "Tests too?", "options": [{"label": "Yes"}, {"label": "No"}]}
        ]}));
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].options, vec!["Rust", "Go"]);
        assert_eq!(questions[0].prompt_text(), "❓ Lang\n\nWhich language?");

        let text = answers_text(&questions, &[Some("Rust".to_string()), None]);
        assert_eq!(
            text,
            "The user answered your questions:\n\nQ: Which language?\nA: Rust"
        );
        assert!(answers_text(&questions, &[None, None]).contains("did not answer"));
        assert_eq!(
            continue_prompt(true, None),
            "Permissions granted, try again."
        );
        assert!(continue_prompt(true, Some("A")).ends_with("\n\nA"));
    }

    #[test]
    fn retry_text_is_appended_unless_empty() {
        assert_eq!(join_replies("first".into(), "  ".into()), "first");
        assert_eq!(join_replies("".into(), "second".into()), "second");
        assert_eq!(join_replies("first\n".into(), "second".into()), "first\n\nsecond");
    }
}
