//! ANSI stripping and terminal echo reconstruction.
//!
//! The sanitizer is a small state machine rather than a regex pass because
//! escape sequences routinely split across PTY read chunks; state carries
//! over between `push` calls so a CSI opened at the end of one chunk is
//! still swallowed at the start of the next.

/// Parser position inside an escape sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    Plain,
    /// Saw ESC, waiting for the introducer byte.
    Esc,
    /// Inside CSI, consuming until a final byte in 0x40..=0x7e.
    Csi,
    /// Inside OSC, consuming until BEL or ESC-backslash.
    Osc,
}

/// Streaming sanitizer: drops ANSI escape sequences and non-printable
/// control bytes, folds carriage returns into newlines, and collapses
/// `\r\n` to a single `\n`.
#[derive(Debug)]
pub(crate) struct AnsiSanitizer {
    state: EscState,
    /// A bare `\r` was emitted as `\n`; the next `\n` is suppressed so
    /// CRLF does not double up. Only printable output clears the flag,
    /// so escape sequences between `\r` and `\n` do not break the pair.
    pending_crlf: bool,
    /// Incomplete multibyte UTF-8 sequence carried across chunks.
    utf8_pending: Vec<u8>,
}

impl AnsiSanitizer {
    pub(crate) fn new() -> Self {
        Self {
            state: EscState::Plain,
            pending_crlf: false,
            utf8_pending: Vec::new(),
        }
    }

    /// Sanitizes one output chunk, appending printable text to `out`.
    pub(crate) fn push(&mut self, chunk: &[u8], out: &mut String) {
        for &b in chunk {
            match self.state {
                EscState::Esc => {
                    self.state = match b {
                        b'[' => EscState::Csi,
                        b']' => EscState::Osc,
                        // Two-byte sequences like ESC ( B or ESC = end here.
                        _ => EscState::Plain,
                    };
                }
                EscState::Csi => {
                    if (0x40..=0x7e).contains(&b) {
                        self.state = EscState::Plain;
                    }
                }
                EscState::Osc => {
                    if b == 0x07 {
                        self.state = EscState::Plain;
                    } else if b == 0x1b {
                        // ESC inside OSC is the start of the ST terminator.
                        self.state = EscState::Esc;
                    }
                }
                EscState::Plain => {
                    if b >= 0x80 {
                        self.push_utf8_byte(b, out);
                        self.pending_crlf = false;
                        continue;
                    }
                    self.flush_utf8(out);
                    match b {
                        0x1b => self.state = EscState::Esc,
                        b'\r' => {
                            out.push('\n');
                            self.pending_crlf = true;
                        }
                        b'\n' => {
                            if self.pending_crlf {
                                self.pending_crlf = false;
                            } else {
                                out.push('\n');
                            }
                        }
                        b'\t' => {
                            out.push('\t');
                            self.pending_crlf = false;
                        }
                        0x20..=0x7e => {
                            out.push(b as char);
                            self.pending_crlf = false;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn push_utf8_byte(&mut self, b: u8, out: &mut String) {
        // A lead byte terminates whatever sequence was pending.
        if b >= 0xc0 {
            self.flush_utf8(out);
        }
        self.utf8_pending.push(b);
        let expected = match self.utf8_pending[0] {
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            // Stray continuation or invalid lead; flush lossy right away.
            _ => 1,
        };
        if self.utf8_pending.len() >= expected {
            self.flush_utf8(out);
        }
    }

    fn flush_utf8(&mut self, out: &mut String) {
        if !self.utf8_pending.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.utf8_pending));
            self.utf8_pending.clear();
        }
    }
}

/// Reconstructs the line a user is typing in terminal mode from raw input
/// bytes, so the replay tail can show input the program does not echo.
/// Handles backspace/DEL by popping a character and renders `^C` for ETX.
#[derive(Debug, Default)]
pub(crate) struct InputEchoLine {
    line: String,
}

impl InputEchoLine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds raw input bytes. Returns completed lines, one entry per
    /// newline seen.
    pub(crate) fn push(&mut self, input: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();
        for ch in String::from_utf8_lossy(input).chars() {
            match ch {
                '\u{7f}' | '\u{8}' => {
                    self.line.pop();
                }
                '\u{3}' => self.line.push_str("^C"),
                '\r' | '\n' => completed.push(std::mem::take(&mut self.line)),
                c if c.is_control() => {}
                c => self.line.push(c),
            }
        }
        completed
    }

    pub(crate) fn partial(&self) -> &str {
        &self.line
    }
}
