//! Formatting utilities (Markdown → Telegram HTML, tool activity, sizes).

use std::{sync::OnceLock, time::Duration};

use regex::Regex;

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Code spans pulled out of the text before escaping, restored at the end.
#[derive(Default)]
struct Protected {
    segments: Vec<String>,
}

impl Protected {
    fn stash(&mut self, html: String) -> String {
        let token = format!("\0P{}\0", self.segments.len());
        self.segments.push(html);
        token
    }

    fn restore(&self, mut text: String) -> String {
        for (i, html) in self.segments.iter().enumerate() {
            text = text.replace(&format!("\0P{i}\0"), html);
        }
        text
    }
}

/// Convert the Markdown Claude writes into the HTML subset Telegram accepts
/// (`<b>`, `<i>`, `<code>`, `<pre>`, `<a>`, `<blockquote>`).
pub fn convert_markdown_to_html(input: &str) -> String {
    let mut protected = Protected::default();
    let text = stash_fenced_blocks(input, &mut protected);
    let text = stash_inline_code(&text, &mut protected);

    let escaped = escape_html(&text);

    let mut lines = Vec::new();
    for line in escaped.split('\n') {
        if is_horizontal_rule(line) {
            continue;
        }
        let line = convert_header_line(line);
        let line = convert_bullet(&line);
        let line = replace_delimited(&line, "**", "<b>", "</b>");
        let line = replace_delimited(&line, "__", "<b>", "</b>");
        let line = replace_single_delim(&line, '_', "<i>", "</i>");
        let line = replace_single_delim(&line, '*', "<b>", "</b>");
        lines.push(line);
    }
    let text = convert_blockquotes(&lines.join("\n"));
    let text = link_re()
        .replace_all(&text, r#"<a href="$2">$1</a>"#)
        .to_string();

    let mut text = protected.restore(text);
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Only http(s) targets; Telegram rejects anything else in href.
    RE.get_or_init(|| Regex::new(r"\[([^\]\n]+)\]\((https?://[^)\s]+)\)").expect("valid regex"))
}

fn stash_fenced_blocks(input: &str, protected: &mut Protected) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("```") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];

        let lang_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '+' || c == '-'))
            .unwrap_or(after.len());
        let lang = &after[..lang_len];
        let body_start = if after[lang_len..].starts_with('\n') {
            lang_len + 1
        } else {
            lang_len
        };

        let Some(end) = after[body_start..].find("```") else {
            // Unclosed fence: leave it as literal text.
            out.push_str(&rest[start..]);
            return out;
        };
        let code = after[body_start..body_start + end].trim_end_matches('\n');
        let html = if lang.is_empty() {
            format!("<pre>{}</pre>", escape_html(code))
        } else {
            format!(
                "<pre><code class=\"language-{}\">{}</code></pre>",
                escape_html(lang),
                escape_html(code)
            )
        };
        out.push_str(&protected.stash(html));
        rest = &after[body_start + end + 3..];
    }
    out.push_str(rest);
    out
}

fn stash_inline_code(input: &str, protected: &mut Protected) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find('`') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(&['`', '\n'][..]) {
            Some(end) if after[end..].starts_with('`') && end > 0 => {
                let html = format!("<code>{}</code>", escape_html(&after[..end]));
                out.push_str(&protected.stash(html));
                rest = &after[end + 1..];
            }
            _ => {
                out.push('`');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_horizontal_rule(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 3 && (t.chars().all(|c| c == '-') || t.chars().all(|c| c == '*'))
}

fn convert_header_line(line: &str) -> String {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if (1..=6).contains(&hashes) {
        if let Some(title) = line[hashes..].strip_prefix(' ') {
            return format!("<b>{}</b>", title.trim());
        }
    }
    line.to_string()
}

fn convert_bullet(line: &str) -> String {
    let indent = line.len() - line.trim_start().len();
    let (lead, body) = line.split_at(indent);
    for marker in ["- ", "* "] {
        if let Some(rest) = body.strip_prefix(marker) {
            return format!("{lead}• {rest}");
        }
    }
    line.to_string()
}

fn replace_delimited(text: &str, delim: &str, open: &str, close: &str) -> String {
    let mut out = String::new();
    let mut rest = text;
    while let Some(start) = rest.find(delim) {
        let after = &rest[start + delim.len()..];
        match after.find(delim) {
            Some(end) if end > 0 => {
                out.push_str(&rest[..start]);
                out.push_str(open);
                out.push_str(&after[..end]);
                out.push_str(close);
                rest = &after[end + delim.len()..];
            }
            _ => break,
        }
    }
    out.push_str(rest);
    out
}

/// Single-character emphasis. Requires a non-space right after the opener and
/// a word boundary around the pair, so `snake_case` and `2 * 3 * 4` survive.
fn replace_single_delim(text: &str, delim: char, open: &str, close: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        let opener = c == delim
            && chars.get(i + 1).is_some_and(|n| !n.is_whitespace() && *n != delim)
            && (i == 0 || !chars[i - 1].is_alphanumeric() && chars[i - 1] != delim);
        if opener {
            let close_at = (i + 2..chars.len()).find(|&j| {
                chars[j] == delim
                    && !chars[j - 1].is_whitespace()
                    && chars.get(j + 1).map_or(true, |n| !n.is_alphanumeric() && *n != delim)
            });
            if let Some(j) = close_at {
                out.push_str(open);
                out.extend(&chars[i + 1..j]);
                out.push_str(close);
                i = j + 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

fn flush_quote(quote: &mut Vec<&str>, result: &mut Vec<String>) {
    if !quote.is_empty() {
        result.push(format!("<blockquote>{}</blockquote>", quote.join("\n")));
        quote.clear();
    }
}

fn convert_blockquotes(text: &str) -> String {
    let mut result: Vec<String> = Vec::new();
    let mut quote: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        if line == "&gt;" {
            quote.push("");
        } else if let Some(content) = line.strip_prefix("&gt; ") {
            quote.push(content);
        } else {
            flush_quote(&mut quote, &mut result);
            result.push(line.to_string());
        }
    }
    flush_quote(&mut quote, &mut result);
    result.join("\n")
}

// ============== Tool activity ==============

fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] => "file".to_string(),
        [only] => only.to_string(),
        [.., dir, file] => format!("{dir}/{file}"),
    }
}

/// Char-safe truncation with a trailing ellipsis.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

fn one_line(text: &str, max_chars: usize) -> String {
    truncate_text(text.replace('\n', " ").trim(), max_chars)
}

fn code(text: &str) -> String {
    format!("<code>{}</code>", escape_html(text))
}

fn tool_emoji(tool_name: &str) -> &'static str {
    match tool_name {
        "Read" => "📖",
        "Write" => "📝",
        "Edit" | "MultiEdit" | "NotebookEdit" => "✏️",
        "Bash" => "▶️",
        "Glob" | "WebSearch" => "🔍",
        "Grep" => "🔎",
        "WebFetch" => "🌐",
        "Task" => "🎯",
        "TodoWrite" => "📋",
        _ => "🔧",
    }
}

/// One line (HTML) describing a tool call, e.g. `📝 Writing <code>src/main.rs</code>`.
pub fn format_tool_status(tool_name: &str, tool_input: &serde_json::Value) -> String {
    let emoji = tool_emoji(tool_name);
    let get = |k: &str| tool_input.get(k).and_then(|v| v.as_str()).unwrap_or("");

    let detail = match tool_name {
        "Read" => {
            let file_path = get("file_path");
            let lower = file_path.to_lowercase();
            const IMAGE_EXTS: [&str; 6] = [".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"];
            if IMAGE_EXTS.iter().any(|ext| lower.ends_with(ext)) {
                return format!("👀 Viewing {}", code(&shorten_path(file_path)));
            }
            format!("Reading {}", code(&shorten_path(file_path)))
        }
        "Write" => format!("Writing {}", code(&shorten_path(get("file_path")))),
        "Edit" | "MultiEdit" => format!("Editing {}", code(&shorten_path(get("file_path")))),
        "NotebookEdit" => format!("Editing {}", code(&shorten_path(get("notebook_path")))),
        "Bash" => match get("description") {
            "" => code(&one_line(get("command"), 50)),
            desc => escape_html(&one_line(desc, 80)),
        },
        "Grep" => match get("path") {
            "" => format!("Searching {}", code(&one_line(get("pattern"), 40))),
            path => format!(
                "Searching {} in {}",
                code(&one_line(get("pattern"), 30)),
                code(&shorten_path(path))
            ),
        },
        "Glob" => format!("Finding {}", code(&one_line(get("pattern"), 50))),
        "WebSearch" => format!("Searching: {}", escape_html(&one_line(get("query"), 50))),
        "WebFetch" => format!("Fetching {}", code(&one_line(get("url"), 50))),
        "Task" if !get("description").is_empty() => {
            format!("Agent: {}", escape_html(&one_line(get("description"), 60)))
        }
        _ => escape_html(tool_name),
    };
    format!("{emoji} {detail}")
}

/// HTML summary of the tools a run used, capped at `max_lines` entries.
pub fn format_tool_activity_log(lines: &[String], max_lines: usize) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let mut out = String::from("<b>Actions:</b>\n");
    for line in lines.iter().take(max_lines) {
        out.push_str(line);
        out.push('\n');
    }
    if lines.len() > max_lines {
        out.push_str(&format!("… and {} more", lines.len() - max_lines));
    }
    Some(out.trim_end().to_string())
}

/// `1.5 MB` style sizes for upload notices.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// `1h 05m`, `3m 12s`, `42s`.
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s:02}s"),
        (h, m, _) => format!("{h}h {m:02}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn code_blocks_keep_contents_and_language() {
        let md = "hi\n```python\nprint('<b>')\n```\nbye";
        let html = convert_markdown_to_html(md);
        assert_eq!(
            html,
            "hi\n<pre><code class=\"language-python\">print('&lt;b&gt;')</code></pre>\nbye"
        );

        let plain = convert_markdown_to_html("```\na * b * c\n```");
        assert_eq!(plain, "<pre>a * b * c</pre>");
    }

    #[test]
    fn unclosed_fence_stays_literal() {
        let html = convert_markdown_to_html("```rust\nfn main() {");
        assert_eq!(html, "```rust\nfn main() {");
    }

    #[test]
    fn inline_emphasis_and_headers() {
        assert_eq!(convert_markdown_to_html("# Title"), "<b>Title</b>");
        assert_eq!(
            convert_markdown_to_html("**bold** and *also* and _it_"),
            "<b>bold</b> and <b>also</b> and <i>it</i>"
        );
        assert_eq!(
            convert_markdown_to_html("use `snake_case` names like my_var_name"),
            "use <code>snake_case</code> names like my_var_name"
        );
        assert_eq!(convert_markdown_to_html("2 * 3 * 4"), "2 * 3 * 4");
    }

    #[test]
    fn lists_quotes_rules_and_links() {
        let md = "- one\n  * two\n---\n> quoted\n> more\nend [docs](https://example.com) [x](javascript:alert(1))";
        let html = convert_markdown_to_html(md);
        assert_eq!(
            html,
            "• one\n  • two\n<blockquote>quoted\nmore</blockquote>\nend <a href=\"https://example.com\">docs</a> [x](javascript:alert(1))"
        );
    }

    #[test]
    fn tool_status_lines() {
        assert_eq!(
            format_tool_status("Write", &json!({"file_path": "/ws/user_1/src/main.rs"})),
            "📝 Writing <code>src/main.rs</code>"
        );
        assert_eq!(
            format_tool_status("Read", &json!({"file_path": "/tmp/a.png"})),
            "👀 Viewing <code>tmp/a.png</code>"
        );
        assert_eq!(
            format_tool_status("Bash", &json!({"command": "ls -la", "description": "List <files>"})),
            "▶️ List &lt;files&gt;"
        );
        assert_eq!(
            format_tool_status("mcp__thing", &json!({})),
            "🔧 mcp__thing"
        );
    }

    #[test]
    fn activity_log_caps_lines() {
        assert_eq!(format_tool_activity_log(&[], 3), None);
        let lines: Vec<String> = (1..=5).map(|i| format!("step {i}")).collect();
        let log = format_tool_activity_log(&lines, 3).unwrap();
        assert_eq!(log, "<b>Actions:</b>\nstep 1\nstep 2\nstep 3\n… and 2 more");
    }

    #[test]
    fn sizes_durations_and_truncation() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(60 * 1024 * 1024), "60.0 MB");
        assert_eq!(human_duration(Duration::from_secs(42)), "42s");
        assert_eq!(human_duration(Duration::from_secs(192)), "3m 12s");
        assert_eq!(human_duration(Duration::from_secs(3900)), "1h 05m");
        assert_eq!(truncate_text("héllo wörld", 5), "héllo…");
        assert_eq!(truncate_text("short", 10), "short");
    }
}
