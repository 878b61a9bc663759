//! Busy detection and the spike filter: the pure, heavily-tested half of
//! status classification. The `Session` type owns the stateful half.

use std::time::{Duration, Instant};

use crate::domain::tool::Tool;
use crate::patterns::spinner::{is_braille, starts_with_box_drawing};
use crate::patterns::ResolvedPatterns;

/// Busy patterns are scanned over this many trailing lines.
const BUSY_SCAN_LINES: usize = 25;

/// Spinner glyphs are only trusted in this many trailing content lines.
const SPINNER_SCAN_LINES: usize = 10;

/// A timestamp change with no second change inside this window is a
/// spike (status-bar redraw, cursor blink), not work.
pub const SPIKE_WINDOW: Duration = Duration::from_secs(1);

/// Consecutive prompt-and-no-busy polls required before an `active`
/// session demotes. Absorbs captures taken exactly between tool calls.
pub const PROMPT_DEMOTE_POLLS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusyCheck {
    pub busy: bool,
    /// True when the evidence was a spinner glyph (feeds the grace
    /// tracker); pattern matches alone don't.
    pub spinner_seen: bool,
}

impl BusyCheck {
    const NOT_BUSY: BusyCheck = BusyCheck {
        busy: false,
        spinner_seen: false,
    };
}

/// Pattern-first, spinner-second busy detection. The caller layers the
/// grace window on top.
pub fn detect_busy(content: &str, tool: &Tool, patterns: &ResolvedPatterns) -> BusyCheck {
    let tail = tail_text(content, BUSY_SCAN_LINES);

    for re in &patterns.busy_regexps {
        if re.is_match(&tail) {
            return BusyCheck {
                busy: true,
                spinner_seen: false,
            };
        }
    }

    for needle in &patterns.busy_strings {
        for line in tail.lines() {
            if !line.contains(needle.as_str()) {
                continue;
            }
            // Welcome banners literally say "ctrl+c to interrupt"; an
            // interrupt hint only counts with working-state context on
            // the same line.
            if needle.contains("interrupt") && !interrupt_context(line, patterns) {
                continue;
            }
            return BusyCheck {
                busy: true,
                spinner_seen: false,
            };
        }
    }

    if let Some(line) = find_spinner_line(content, patterns) {
        // Asterisk glyphs show up in finished-turn decorations too; for
        // claude require the braille form or working-state context.
        let accepted = match tool {
            Tool::Claude => {
                line.chars().any(is_braille) || line.contains('…') || line.contains("interrupt")
            }
            _ => true,
        };
        if accepted {
            return BusyCheck {
                busy: true,
                spinner_seen: true,
            };
        }
    }

    BusyCheck::NOT_BUSY
}

fn interrupt_context(line: &str, patterns: &ResolvedPatterns) -> bool {
    line.contains('(')
        || line.contains("tokens")
        || line.contains("thinking")
        || line.contains('…')
        || line.contains('·')
        || line.chars().any(|c| patterns.has_spinner(c))
}

/// The last spinner-bearing line among the trailing non-empty,
/// non-box-drawing lines, if any.
fn find_spinner_line<'a>(content: &'a str, patterns: &ResolvedPatterns) -> Option<&'a str> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !starts_with_box_drawing(l))
        .collect::<Vec<_>>()
        .iter()
        .rev()
        .take(SPINNER_SCAN_LINES)
        .find(|l| l.chars().any(|c| patterns.has_spinner(c)))
        .copied()
}

fn tail_text(content: &str, n: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// What a tick should do about capturing, given the activity timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureDecision {
    /// Capture and fully classify this tick.
    Capture,
    /// A spike window just opened; report the previous stable status and
    /// wait for confirmation.
    HoldStable,
    /// Nothing changed; the previous stable status stands.
    Skip,
}

/// Spike-filter state machine over window-activity timestamps.
#[derive(Debug, Clone, Default)]
pub struct SpikeFilter {
    last_timestamp: Option<i64>,
    window_opened: Option<Instant>,
    change_count: u32,
}

impl SpikeFilter {
    /// Feed one observed timestamp. `fast_path` forces a capture
    /// regardless of spike state (used while the session is active or
    /// starting, where every tick must re-evaluate evidence).
    pub fn observe(&mut self, ts: i64, fast_path: bool) -> CaptureDecision {
        let changed = match self.last_timestamp {
            None => {
                self.last_timestamp = Some(ts);
                return CaptureDecision::Capture;
            }
            Some(prev) => prev != ts,
        };
        self.last_timestamp = Some(ts);

        if fast_path {
            return CaptureDecision::Capture;
        }

        if changed {
            let window_fresh = self
                .window_opened
                .is_some_and(|at| at.elapsed() < SPIKE_WINDOW);
            if window_fresh {
                self.change_count += 1;
            } else {
                self.window_opened = Some(Instant::now());
                self.change_count = 1;
            }
            if self.change_count >= 2 {
                CaptureDecision::Capture
            } else {
                CaptureDecision::HoldStable
            }
        } else {
            // Close stale windows so an old lone bump doesn't pair with
            // a much later one.
            if self
                .window_opened
                .is_some_and(|at| at.elapsed() >= SPIKE_WINDOW)
            {
                self.reset_window();
            }
            CaptureDecision::Skip
        }
    }

    /// A capture ran and was classified; the window has served its
    /// purpose either way.
    pub fn reset_window(&mut self) {
        self.window_opened = None;
        self.change_count = 0;
    }

    pub fn forget(&mut self) {
        self.last_timestamp = None;
        self.reset_window();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{compile, default_raw};

    fn claude() -> ResolvedPatterns {
        compile(&default_raw(&Tool::Claude))
    }

    #[test]
    fn test_classical_active_capture() {
        // The canonical working screen.
        let check = detect_busy(
            "✳ Gusting… (35s · ↑ 673 tokens)\n❯\n",
            &Tool::Claude,
            &claude(),
        );
        assert!(check.busy);
    }

    #[test]
    fn test_welcome_banner_not_busy() {
        // A marketing banner that happens to end in an ellipsis.
        let content =
            "Opus 4.6 is here · $50 free extra usage · Try fast mode or use i…\n❯\n";
        let check = detect_busy(content, &Tool::Claude, &claude());
        assert!(!check.busy);
    }

    #[test]
    fn test_interrupt_without_context_not_busy() {
        // An interrupt hint quoted in plain output.
        let content = "Some text mentioning esc to interrupt from docs\n❯\n";
        let check = detect_busy(content, &Tool::Claude, &claude());
        assert!(!check.busy);
    }

    #[test]
    fn test_interrupt_with_context_busy() {
        let content = "⠙ Thinking... (25s · 340 tokens · ctrl+c to interrupt)\n";
        let check = detect_busy(content, &Tool::Claude, &claude());
        assert!(check.busy);
    }

    #[test]
    fn test_braille_spinner_busy() {
        let check = detect_busy("⠹ Editing src/main.rs\nesc to interrupt (3s)\n", &Tool::Claude, &claude());
        assert!(check.busy);
    }

    #[test]
    fn test_lone_braille_spinner_marks_tracker() {
        let check = detect_busy("⠹ working\n", &Tool::Claude, &claude());
        assert!(check.busy);
        assert!(check.spinner_seen);
    }

    #[test]
    fn test_claude_asterisk_alone_not_enough() {
        // An asterisk glyph with neither braille, ellipsis nor interrupt
        // context is a done decoration.
        let check = detect_busy("✢ done summary line\n❯\n", &Tool::Claude, &claude());
        assert!(!check.busy);
    }

    #[test]
    fn test_spinner_in_box_drawing_line_ignored() {
        let check = detect_busy("│ ✳ quoted transcript…\n❯\n", &Tool::Claude, &claude());
        assert!(!check.busy);
    }

    #[test]
    fn test_spinner_too_far_up_ignored() {
        let mut content = String::from("⠹ old spinner\n");
        for i in 0..12 {
            content.push_str(&format!("output line {i}\n"));
        }
        let check = detect_busy(&content, &Tool::Claude, &claude());
        assert!(!check.busy);
    }

    #[test]
    fn test_busy_regex_outside_tail_ignored() {
        let mut content = String::from("✳ Ancient activity… (1s)\n");
        for i in 0..30 {
            content.push_str(&format!("line {i}\n"));
        }
        let check = detect_busy(&content, &Tool::Claude, &claude());
        assert!(!check.busy);
    }

    #[test]
    fn test_opencode_blocks_busy() {
        let patterns = compile(&default_raw(&Tool::Opencode));
        let check = detect_busy("▓▒░ working\n", &Tool::Opencode, &patterns);
        assert!(check.busy);
        assert!(check.spinner_seen);
    }

    #[test]
    fn test_spike_filter_first_observation_captures() {
        let mut filter = SpikeFilter::default();
        assert_eq!(filter.observe(100, false), CaptureDecision::Capture);
    }

    #[test]
    fn test_spike_single_change_held() {
        // A lone status-bar bump, then quiet.
        let mut filter = SpikeFilter::default();
        filter.observe(100, false);
        assert_eq!(filter.observe(101, false), CaptureDecision::HoldStable);
        assert_eq!(filter.observe(101, false), CaptureDecision::Skip);
        assert_eq!(filter.observe(101, false), CaptureDecision::Skip);
    }

    #[test]
    fn test_spike_sustained_changes_capture() {
        // Real work: changes on consecutive ticks inside 1 s.
        let mut filter = SpikeFilter::default();
        filter.observe(100, false);
        assert_eq!(filter.observe(101, false), CaptureDecision::HoldStable);
        assert_eq!(filter.observe(102, false), CaptureDecision::Capture);
    }

    #[test]
    fn test_spike_fast_path_always_captures() {
        let mut filter = SpikeFilter::default();
        filter.observe(100, false);
        assert_eq!(filter.observe(100, true), CaptureDecision::Capture);
        assert_eq!(filter.observe(105, true), CaptureDecision::Capture);
    }

    #[test]
    fn test_spike_window_expires() {
        let mut filter = SpikeFilter::default();
        filter.observe(100, false);
        assert_eq!(filter.observe(101, false), CaptureDecision::HoldStable);
        // Simulate the window aging out.
        filter.window_opened = Some(Instant::now() - SPIKE_WINDOW);
        // A later lone change opens a fresh window instead of confirming.
        assert_eq!(filter.observe(102, false), CaptureDecision::HoldStable);
    }
}
