//! Splits long responses into Telegram-sized messages.
//!
//! Bodies are contiguous slices of the input, so joining them gives back the
//! original text. When more than one chunk is needed each rendered message
//! starts with an `[i/N]` marker; a single chunk is sent as-is.

use std::fmt;

/// Telegram's hard cap on message text.
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

/// Room kept free in every chunk for the `[i/N]\n\n` marker.
pub const MARKER_RESERVE: usize = 12;

/// A response split into chunks. Cheap to build; chunks are produced lazily.
#[derive(Clone, Debug)]
pub struct SplitMessage<'a> {
    bodies: Vec<&'a str>,
}

/// One chunk of a [`SplitMessage`]. `index` is 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: usize,
    pub total: usize,
    pub body: &'a str,
}

impl Chunk<'_> {
    /// `[i/N]` for multi-chunk messages.
    pub fn marker(&self) -> Option<String> {
        if self.total > 1 {
            Some(format!("[{}/{}]", self.index, self.total))
        } else {
            None
        }
    }

    /// Prefix `body` with the marker, if any.
    pub fn decorate(&self, body: &str) -> String {
        match self.marker() {
            Some(m) => format!("{m}\n\n{body}"),
            None => body.to_string(),
        }
    }

    pub fn render(&self) -> String {
        self.decorate(self.body)
    }
}

impl fmt::Display for Chunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl<'a> SplitMessage<'a> {
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk<'a>> + '_ {
        let total = self.bodies.len();
        self.bodies.iter().copied().enumerate().map(move |(i, body)| Chunk {
            index: i + 1,
            total,
            body,
        })
    }
}

/// Split `text` so every rendered chunk (marker included) has at most `limit`
/// characters.
pub fn split(text: &str, limit: usize) -> SplitMessage<'_> {
    if text.is_empty() {
        return SplitMessage { bodies: Vec::new() };
    }
    if text.chars().count() <= limit {
        return SplitMessage { bodies: vec![text] };
    }

    let budget = limit.saturating_sub(MARKER_RESERVE).max(1);
    let mut bodies = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let cut = split_point(rest, budget);
        let (head, tail) = rest.split_at(cut);
        bodies.push(head);
        rest = tail;
    }
    SplitMessage { bodies }
}

/// Byte offset where the next chunk should end: at most `budget` chars,
/// preferring a paragraph break, then a line break, then whitespace.
fn split_point(rest: &str, budget: usize) -> usize {
    let window_end = match rest.char_indices().nth(budget) {
        Some((i, _)) => i,
        None => return rest.len(),
    };
    let window = &rest[..window_end];

    // Only accept a soft break in the back half of the window so chunks stay
    // reasonably full.
    let floor = window.len() / 2;
    let soft = window
        .rfind("\n\n")
        .map(|i| i + 2)
        .filter(|&i| i > floor)
        .or_else(|| window.rfind('\n').map(|i| i + 1).filter(|&i| i > floor))
        .or_else(|| {
            window
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map(|(i, c)| i + c.len_utf8())
                .filter(|&i| i > floor)
        });

    soft.unwrap_or(window_end)
}

/// Tracks ``` fences across chunks so each chunk renders as balanced Markdown.
///
/// Only affects rendering: a chunk ending inside a code block gets a closing
/// fence appended, and the next chunk gets the opening fence (with its
/// language tag) prepended.
#[derive(Clone, Debug, Default)]
pub struct FenceBalancer {
    open: Option<String>,
}

impl FenceBalancer {
    pub fn balance(&mut self, body: &str) -> String {
        let mut out = String::with_capacity(body.len() + 16);
        if let Some(fence) = &self.open {
            out.push_str(fence);
            out.push('\n');
        }
        out.push_str(body);

        for line in body.lines() {
            let trimmed = line.trim_start();
            if !trimmed.starts_with("```") {
                continue;
            }
            self.open = match self.open {
                Some(_) => None,
                None => Some(trimmed.trim_end().to_string()),
            };
        }

        if self.open.is_some() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```");
        }
        out
    }
}
