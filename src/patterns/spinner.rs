use std::time::{Duration, Instant};

/// The ten frames of the classic braille dots spinner. Claude Code cycles
/// these in both the pane and the pane title while a tool call runs.
pub const BRAILLE_DOTS: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// Asterisk-style glyphs that only appear while Claude is actively working.
/// `✻` and `·` are deliberately absent: they show up in "done" lines too,
/// so treating them as activity evidence causes false `active` states.
pub const CLAUDE_ACTIVE_GLYPHS: [char; 4] = ['✳', '✽', '✶', '✢'];

/// Block glyphs opencode animates while generating.
pub const OPENCODE_BLOCKS: [char; 4] = ['█', '▓', '▒', '░'];

/// Glyphs stripped during content normalization: everything any tool
/// animates, plus the idle decorations `✻` and `·` so a done-line redraw
/// doesn't read as a content change.
pub fn is_normalizable_glyph(c: char) -> bool {
    is_braille(c)
        || CLAUDE_ACTIVE_GLYPHS.contains(&c)
        || OPENCODE_BLOCKS.contains(&c)
        || c == '✻'
        || c == '·'
}

pub fn is_braille(c: char) -> bool {
    ('\u{2800}'..='\u{28FF}').contains(&c)
}

/// Characters that start TUI box-drawing lines. Spinner scans skip these
/// lines so frame borders don't shadow the real content.
pub const BOX_DRAWING: [char; 14] = [
    '│', '├', '└', '─', '┌', '┐', '┘', '┤', '┬', '┴', '┼', '╭', '╮', '╯',
];

pub fn starts_with_box_drawing(line: &str) -> bool {
    line.trim_start()
        .chars()
        .next()
        .is_some_and(|c| BOX_DRAWING.contains(&c) || c == '╰')
}

/// How long a session stays classified busy after the last spinner
/// sighting. Between tool calls the spinner disappears for a poll or two;
/// without this window the status flaps active → waiting → active.
pub const SPINNER_GRACE: Duration = Duration::from_secs(6);

/// Records the most recent sighting of an active spinner glyph.
#[derive(Debug, Clone)]
pub struct SpinnerActivityTracker {
    last_busy_time: Option<Instant>,
    grace_period: Duration,
}

impl Default for SpinnerActivityTracker {
    fn default() -> Self {
        Self::new(SPINNER_GRACE)
    }
}

impl SpinnerActivityTracker {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            last_busy_time: None,
            grace_period,
        }
    }

    pub fn mark_busy(&mut self) {
        self.last_busy_time = Some(Instant::now());
    }

    pub fn in_grace_period(&self) -> bool {
        self.last_busy_time
            .is_some_and(|t| t.elapsed() < self.grace_period)
    }

    pub fn last_busy_time(&self) -> Option<Instant> {
        self.last_busy_time
    }

    /// Forget all spinner history. Called on respawn so a replaced pane
    /// doesn't inherit the old process's grace window.
    pub fn reset(&mut self) {
        self.last_busy_time = None;
    }
}
