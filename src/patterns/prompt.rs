//! Tool-specific prompt detection: is the agent sitting at an input
//! prompt or a permission dialog, waiting for the user?

use crate::domain::tool::Tool;
use crate::patterns::ResolvedPatterns;

/// Dialog fragments that mean an agent is blocked on a human decision.
const PERMISSION_FRAGMENTS: &[&str] = &[
    "Do you want",
    "Would you like",
    "Yes, allow once",
    "Yes, allow",
    "No, deny",
    "Press enter to confirm",
    "Use arrow keys",
];

/// How many trailing lines of a capture the detector inspects. Prompts
/// live at the bottom of the screen.
const SCAN_LINES: usize = 15;

#[derive(Debug, Clone)]
pub struct PromptDetector {
    tool: Tool,
}

impl PromptDetector {
    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    /// True when the pane content shows an input prompt or permission
    /// dialog for this tool.
    pub fn detect(&self, content: &str, patterns: &ResolvedPatterns) -> bool {
        // opencode's TUI keeps its frame (and prompt strings) permanently
        // on screen; anything carrying a busy signal is not a prompt.
        if matches!(self.tool, Tool::Opencode) && has_busy_signal(content, patterns) {
            return false;
        }

        let tail: Vec<&str> = tail_lines(content, SCAN_LINES);
        let tail_text = tail.join("\n");

        if patterns.prompt_strings.iter().any(|s| tail_text.contains(s))
            || patterns.prompt_regexps.iter().any(|re| re.is_match(&tail_text))
        {
            return true;
        }

        if PERMISSION_FRAGMENTS.iter().any(|f| tail_text.contains(f)) {
            return true;
        }

        // Numbered selection dialogs: "❯ 1. Yes" / "› 1. Yes, proceed".
        if tail.iter().any(|l| {
            let t = l.trim_start();
            (t.starts_with("❯ ") || t.starts_with("› "))
                && t.chars().nth(2).is_some_and(|c| c.is_ascii_digit())
        }) {
            return true;
        }

        match self.tool {
            Tool::Shell | Tool::Custom(_) => tail.iter().rev().take(3).any(|l| {
                let t = l.trim_end();
                t.ends_with('$')
                    || t.ends_with('#')
                    || t.ends_with('%')
                    || t.ends_with('❯')
                    || t.ends_with('➜')
            }),
            // Agent TUIs: an input line that is just the prompt marker,
            // ASCII or U+276F.
            _ => tail.iter().any(|l| {
                let t = l.trim();
                t == "❯" || t == ">" || t.starts_with("❯ ")
            }),
        }
    }
}

fn has_busy_signal(content: &str, patterns: &ResolvedPatterns) -> bool {
    patterns.busy_strings.iter().any(|s| content.contains(s))
        || patterns.busy_regexps.iter().any(|re| re.is_match(content))
}

/// The last `n` non-empty lines of the content, in order.
pub fn tail_lines(content: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{compile, default_raw};

    fn detect(tool: Tool, content: &str) -> bool {
        let patterns = compile(&default_raw(&tool));
        PromptDetector::new(tool).detect(content, &patterns)
    }

    #[test]
    fn test_claude_input_prompt() {
        assert!(detect(Tool::Claude, "some output\n❯\n"));
        assert!(detect(Tool::Claude, "done editing\n❯ \n"));
        assert!(!detect(Tool::Claude, "just output, no prompt\n"));
    }

    #[test]
    fn test_claude_permission_dialog() {
        let content = "Allow write to src/main.rs?\n  Yes, allow once\n  No, deny\n";
        assert!(detect(Tool::Claude, content));
    }

    #[test]
    fn test_codex_selection_dialog() {
        let content =
            "Would you like to run the following command?\n› 1. Yes, proceed (y)\n  2. No (esc)\n";
        assert!(detect(Tool::Codex, content));
    }

    #[test]
    fn test_codex_prompt_strings() {
        assert!(detect(Tool::Codex, "How can I help you today?\n"));
        assert!(detect(Tool::Codex, "codex>\n"));
    }

    #[test]
    fn test_gemini_prompt() {
        assert!(detect(Tool::Gemini, "gemini>\n"));
        assert!(detect(Tool::Gemini, "Type your message\n"));
        assert!(!detect(Tool::Gemini, "working on it\n"));
    }

    #[test]
    fn test_opencode_busy_frame_rejected() {
        // The prompt string is on screen, but so is a busy signal; the
        // permanently-visible frame must not read as a prompt.
        let content = "Ask anything\n⬝■■■■■■⬝  esc interrupt\n";
        assert!(!detect(Tool::Opencode, content));
        assert!(detect(Tool::Opencode, "Ask anything\npress enter to send\n"));
    }

    #[test]
    fn test_shell_prompt() {
        assert!(detect(Tool::Shell, "total 42\n/home/user $\n"));
        assert!(detect(Tool::Shell, "➜\n"));
        assert!(!detect(Tool::Shell, "cargo build --release\nCompiling...\n"));
    }

    #[test]
    fn test_prompt_only_scanned_in_tail() {
        // A prompt marker buried 20+ non-empty lines up doesn't count.
        let mut content = String::from("❯\n");
        for i in 0..30 {
            content.push_str(&format!("line {i}\n"));
        }
        assert!(!detect(Tool::Claude, &content));
    }
}
