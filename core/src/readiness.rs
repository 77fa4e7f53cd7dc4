//! Readiness inference from program output.
//!
//! Interactive programs do not announce readiness on any structured channel,
//! so we watch the sanitized output tail for program-specific signature
//! strings, with a generic bare-prompt check as a second chance. A fallback
//! timer at the session layer bounds the wait when both miss.

use crate::program::ProgramSpec;
use crate::sanitize::AnsiSanitizer;

/// Upper bound on the lowercased text tail kept for matching. Signatures are
/// short; anything older than this cannot start a match that ends in fresh
/// output.
const TAIL_MAX_CHARS: usize = 2048;

/// Prompt glyphs accepted as a bare-prompt readiness signal when they are
/// the entire last non-empty line.
const PROMPT_GLYPHS: [&str; 4] = [">", "\u{276f}", "$", "%"];

#[derive(Debug)]
pub(crate) struct ReadinessDetector {
    sanitizer: AnsiSanitizer,
    tail: String,
}

impl ReadinessDetector {
    pub(crate) fn new() -> Self {
        Self {
            sanitizer: AnsiSanitizer::new(),
            tail: String::new(),
        }
    }

    /// Feeds one raw output chunk into the matching window.
    pub(crate) fn observe(&mut self, chunk: &[u8]) {
        let mut text = String::new();
        self.sanitizer.push(chunk, &mut text);
        for ch in text.chars() {
            self.tail.extend(ch.to_lowercase());
        }
        if self.tail.chars().count() > TAIL_MAX_CHARS {
            let drop = self.tail.chars().count() - TAIL_MAX_CHARS;
            let cut = self
                .tail
                .char_indices()
                .nth(drop)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.tail.drain(..cut);
        }
    }

    /// True once the tail contains any of the program's ready signatures, or
    /// the last non-empty line is a bare prompt glyph.
    pub(crate) fn is_ready(&self, program: &ProgramSpec) -> bool {
        if program
            .ready_signatures
            .iter()
            .any(|sig| self.tail.contains(sig.as_str()))
        {
            return true;
        }
        self.tail
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .is_some_and(|line| PROMPT_GLYPHS.contains(&line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramCatalog;

    fn claude() -> ProgramSpec {
        ProgramCatalog::builtin()
            .get("claude")
            .expect("claude in catalog")
            .clone()
    }

    #[test]
    fn signature_match_is_case_insensitive() {
        let mut d = ReadinessDetector::new();
        d.observe(b"Welcome!\r\n  ? For Shortcuts\r\n");
        assert!(d.is_ready(&claude()));
    }

    #[test]
    fn ansi_wrapped_signature_split_across_chunks() {
        let mut d = ReadinessDetector::new();
        d.observe(b"\x1b[2m? for sho");
        assert!(!d.is_ready(&claude()));
        d.observe(b"rtcuts\x1b[0m");
        assert!(d.is_ready(&claude()));
    }

    #[test]
    fn bare_prompt_glyph_on_last_line_counts() {
        let mut d = ReadinessDetector::new();
        d.observe(b"booting things\r\n> \r\n");
        assert!(d.is_ready(&claude()));
    }

    #[test]
    fn prompt_glyph_inside_text_does_not_count() {
        let mut d = ReadinessDetector::new();
        d.observe(b"loading > 50% done\r\nstill working\r\n");
        assert!(!d.is_ready(&claude()));
    }
}
