//! Pane-content normalization for stable change detection.
//!
//! Captured pane text is full of churn that means nothing: spinner frames,
//! token counters, progress bars, clocks. Normalization strips all of it so
//! that two captures of the "same" screen hash identically. The hash is
//! evidence of *change*, never of activity on its own.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::patterns::spinner::is_normalizable_glyph;

// Dynamic status like "(35s · ↑ 673 tokens · esc to interrupt)". The `·`
// separators are gone by the time this runs (step 3 strips them), so the
// tail after the duration is matched loosely.
static DYNAMIC_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((?:\d+m\s+)?\d+s[^)]*\)").unwrap());

// "Thinking… (...)" tails left over after glyph removal.
static THINKING_TAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"…\s*\(\.\.\.\)").unwrap());

static PROGRESS_BAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[=*>?[ ·]*\]\s*\d{1,3}%").unwrap());

static SIZE_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?\s*[KMG]B/\d+(?:\.\d+)?\s*[KMG]B").unwrap());

static BARE_PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{1,3}%").unwrap());

static CLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}(?::\d{2})?\b").unwrap());

/// Strip ANSI escape sequences with a single-pass scanner.
///
/// Grammar handled (the complete set tmux emits into captures):
/// CSI `ESC [ params letter`, OSC `ESC ] ... BEL|ESC \`, the 8-bit CSI
/// introducer U+009B, and two-byte `ESC X` sequences. Never implemented
/// with a backtracking regex; pane captures can be megabytes.
pub fn strip_ansi(input: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Normal,
        Esc,
        EscCharset,
        Csi,
        Osc,
        OscEsc,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Normal;

    for c in input.chars() {
        match state {
            State::Normal => match c {
                '\u{1b}' => state = State::Esc,
                '\u{9b}' => state = State::Csi,
                _ => out.push(c),
            },
            State::Esc => match c {
                '[' => state = State::Csi,
                ']' => state = State::Osc,
                // Charset designators carry one more byte (ESC ( B).
                '(' | ')' | '*' | '+' => state = State::EscCharset,
                // Any other ESC-X two-byte sequence: swallow X.
                _ => state = State::Normal,
            },
            State::EscCharset => state = State::Normal,
            State::Csi => {
                // Parameter and intermediate bytes are 0x20-0x3F; the
                // final byte 0x40-0x7E terminates the sequence.
                if ('\u{40}'..='\u{7e}').contains(&c) {
                    state = State::Normal;
                }
            }
            State::Osc => match c {
                '\u{07}' => state = State::Normal,
                '\u{1b}' => state = State::OscEsc,
                _ => {}
            },
            State::OscEsc => match c {
                '\\' => state = State::Normal,
                '\u{07}' => state = State::Normal,
                // Stray ESC inside OSC body: stay in the body.
                _ => state = State::Osc,
            },
        }
    }

    out
}

/// Full normalization pipeline. Idempotent: normalizing normalized
/// content is a no-op.
pub fn normalize(content: &str) -> String {
    // 1. ANSI escapes.
    let text = strip_ansi(content);

    // 2. Remaining control characters except TAB/LF/CR, and
    // 3. every spinner glyph (active set plus the idle decorations).
    let text: String = text
        .chars()
        .filter(|&c| {
            let is_control = c.is_ascii_control() && c != '\t' && c != '\n' && c != '\r';
            !is_control && !is_normalizable_glyph(c)
        })
        .collect();

    // 4. Dynamic status substrings → constant token.
    let text = DYNAMIC_STATUS.replace_all(&text, "(...)");

    // 5. Spinner-line tails "… (...)" → constant.
    let text = THINKING_TAIL.replace_all(&text, "…(...)");

    // 6. Progress indicators.
    let text = PROGRESS_BAR.replace_all(&text, "[BAR]");
    let text = SIZE_PAIR.replace_all(&text, "SIZE/SIZE");
    let text = BARE_PERCENT.replace_all(&text, "N%");
    let text = CLOCK.replace_all(&text, "TIME");

    // 7. Right-trim lines, collapse runs of 3+ newlines to 2.
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run >= 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    // lines() drops a trailing newline; captures always end with one, so
    // the single trailing '\n' we keep is stable either way.
    out
}

/// SHA-256 of the normalized content, hex-encoded.
pub fn content_hash(content: &str) -> String {
    let normalized = normalize(content);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_csi() {
        assert_eq!(strip_ansi("\x1b[32mgreen\x1b[0m"), "green");
        assert_eq!(strip_ansi("\x1b[1;38;5;208mbold\x1b[m"), "bold");
    }

    #[test]
    fn test_strip_osc_bel_and_st() {
        assert_eq!(strip_ansi("\x1b]0;title\x07body"), "body");
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn test_strip_8bit_csi() {
        assert_eq!(strip_ansi("a\u{9b}32mb"), "ab");
    }

    #[test]
    fn test_strip_two_byte_escape() {
        assert_eq!(strip_ansi("\x1b(Btext"), "text");
        assert_eq!(strip_ansi("\x1b=text"), "text");
    }

    #[test]
    fn test_strip_plain_text_unchanged() {
        assert_eq!(strip_ansi("plain text"), "plain text");
        assert_eq!(strip_ansi(""), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        let raw = "\x1b[32m✳ Gusting… (35s · ↑ 673 tokens)\x1b[0m\n\n\n\n❯   \n";
        let once = normalize(raw);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_strips_spinner_frames() {
        // Two frames of the same status line hash identically.
        let a = "⠋ Thinking… (12s · ↑ 100 tokens)\n";
        let b = "⠙ Thinking… (13s · ↑ 104 tokens)\n";
        assert_eq!(normalize(a), normalize(b));
        assert_eq!(content_hash(a), content_hash(b));
    }

    #[test]
    fn test_normalize_trailing_whitespace_stable() {
        // Width changes that only add trailing spaces don't change the hash.
        let a = "line one  \nline two\n";
        let b = "line one\nline two      \n";
        assert_eq!(content_hash(a), content_hash(b));
    }

    #[test]
    fn test_normalize_collapses_blank_runs() {
        let text = "a\n\n\n\n\nb\n";
        assert_eq!(normalize(text), "a\n\nb\n");
    }

    #[test]
    fn test_normalize_progress_indicators() {
        let n = normalize("[===>  ] 42% 1.2MB/3.4MB 12:35:07\n");
        assert!(!n.contains("42"), "{n}");
        assert!(n.contains("[BAR]"));
        assert!(n.contains("SIZE/SIZE"));
        assert!(n.contains("TIME"));
    }

    #[test]
    fn test_normalize_keeps_real_content() {
        let n = normalize("fn main() {}\n│ boxed\n");
        assert!(n.contains("fn main() {}"));
        assert!(n.contains("│ boxed"));
    }

    #[test]
    fn test_hash_differs_on_real_change() {
        assert_ne!(content_hash("output A\n"), content_hash("output B\n"));
    }
}
