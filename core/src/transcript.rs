//! Chat transcript assembly.
//!
//! Chat-mode sessions distill the raw terminal stream into a message list.
//! Output before the first user message is startup chrome and is discarded;
//! after that, sanitized output coalesces into the currently open assistant
//! message until the next user message closes it. The whole transcript lives
//! under a byte budget, evicting oldest messages first.

use std::collections::VecDeque;

use chrono::Utc;
use regex_lite::Regex;
use ttymux_protocol::MessageRole;
use ttymux_protocol::TranscriptMessage;

use crate::sanitize::AnsiSanitizer;

const DEFAULT_TRANSCRIPT_BUDGET: usize = 512 * 1024;
const TITLE_MAX_CHARS: usize = 60;

/// Line-level filter for runtime noise that the wrapped programs print to
/// the same stream as their answers. The pattern set is a policy table,
/// expected to grow as new noise shows up in transcripts.
#[derive(Debug)]
pub(crate) struct NoiseFilter {
    patterns: Vec<Regex>,
}

impl NoiseFilter {
    pub(crate) fn default_policy() -> Self {
        let sources = [
            r"DeprecationWarning",
            r"ExperimentalWarning",
            r"\(node:\d+\)",
            r"punycode",
            r"--trace-deprecation",
            r"^\s*at\s+\S+\s+\(.*:\d+:\d+\)\s*$",
            r"NODE_TLS_REJECT_UNAUTHORIZED",
        ];
        Self {
            patterns: sources.iter().filter_map(|s| Regex::new(s).ok()).collect(),
        }
    }

    fn is_noise(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }
}

#[derive(Debug)]
pub(crate) struct Transcript {
    messages: VecDeque<TranscriptMessage>,
    total_bytes: usize,
    max_bytes: usize,
    user_messages: u64,
    /// The last message is an assistant message still accepting output.
    assistant_open: bool,
    filter: NoiseFilter,
    sanitizer: AnsiSanitizer,
    /// Previous appended line was blank, used to collapse blank runs.
    trailing_blank: bool,
}

impl Transcript {
    pub(crate) fn new() -> Self {
        Self::with_budget(DEFAULT_TRANSCRIPT_BUDGET)
    }

    pub(crate) fn with_budget(max_bytes: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
            user_messages: 0,
            assistant_open: false,
            filter: NoiseFilter::default_policy(),
            sanitizer: AnsiSanitizer::new(),
            trailing_blank: false,
        }
    }

    /// Records a user message. Returns true when it is the first one, which
    /// is the signal to derive a session title.
    pub(crate) fn record_user(&mut self, content: &str) -> bool {
        self.user_messages += 1;
        self.assistant_open = false;
        self.trailing_blank = false;
        self.push_message(TranscriptMessage {
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: Utc::now(),
        });
        self.user_messages == 1
    }

    /// Feeds raw program output. Dropped entirely until the first user
    /// message has been recorded.
    pub(crate) fn push_output(&mut self, chunk: &[u8]) {
        let mut text = String::new();
        self.sanitizer.push(chunk, &mut text);
        if self.user_messages == 0 || text.is_empty() {
            return;
        }

        let mut kept = String::new();
        for line in text.split_inclusive('\n') {
            let body = line.trim_end_matches('\n');
            if self.filter.is_noise(body) {
                continue;
            }
            let blank = body.trim().is_empty();
            if blank && self.trailing_blank {
                continue;
            }
            self.trailing_blank = blank && line.ends_with('\n');
            kept.push_str(line);
        }
        if kept.is_empty() {
            return;
        }

        if self.assistant_open
            && let Some(last) = self.messages.back_mut()
        {
            last.content.push_str(&kept);
            last.timestamp = Utc::now();
            self.total_bytes += kept.len();
        } else {
            self.assistant_open = true;
            self.push_message(TranscriptMessage {
                role: MessageRole::Assistant,
                content: kept,
                timestamp: Utc::now(),
            });
        }
        self.evict();
    }

    fn push_message(&mut self, message: TranscriptMessage) {
        self.total_bytes += message.content.len();
        self.messages.push_back(message);
        self.evict();
    }

    // Oldest messages go first, but at least one always stays even when it
    // alone exceeds the budget.
    fn evict(&mut self) {
        while self.total_bytes > self.max_bytes && self.messages.len() > 1 {
            if let Some(evicted) = self.messages.pop_front() {
                self.total_bytes -= evicted.content.len();
            }
        }
    }

    pub(crate) fn messages(&self) -> Vec<TranscriptMessage> {
        self.messages.iter().cloned().collect()
    }

    pub(crate) fn has_user_message(&self) -> bool {
        self.user_messages > 0
    }
}

/// Derives a history title from the first user message: its first line,
/// clamped on a character boundary.
pub(crate) fn derive_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    title.push('\u{2026}');
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn output_before_first_user_message_is_dropped() {
        let mut t = Transcript::new();
        t.push_output(b"startup banner\r\nlogin ok\r\n");
        assert!(t.messages().is_empty());

        t.record_user("hello");
        t.push_output(b"hi there\r\n");
        let messages = t.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, "hi there\n");
    }

    #[test]
    fn assistant_chunks_coalesce_until_next_user_message() {
        let mut t = Transcript::new();
        t.record_user("question one");
        t.push_output(b"part one ");
        t.push_output(b"part two\r\n");
        t.record_user("question two");
        t.push_output(b"fresh answer\r\n");

        let messages = t.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "part one part two\n");
        assert_eq!(messages[3].content, "fresh answer\n");
    }

    #[test]
    fn noise_lines_and_blank_runs_are_filtered() {
        let mut t = Transcript::new();
        t.record_user("q");
        t.push_output(
            b"(node:123) DeprecationWarning: punycode is deprecated\r\nanswer\r\n\r\n\r\ntail\r\n",
        );
        let messages = t.messages();
        assert_eq!(messages[1].content, "answer\n\ntail\n");
    }

    #[test]
    fn eviction_keeps_newest_and_never_empties() {
        let mut t = Transcript::with_budget(32);
        t.record_user("0123456789012345678901234567890123456789");
        assert_eq!(t.messages().len(), 1);
        t.push_output(b"aaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        let messages = t.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
    }

    #[test]
    fn title_clamps_on_char_boundary() {
        assert_eq!(derive_title("short question"), "short question");
        let long = "x".repeat(100);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 61);
        assert!(title.ends_with('\u{2026}'));
        assert_eq!(derive_title("first line\nsecond line"), "first line");
    }
}
