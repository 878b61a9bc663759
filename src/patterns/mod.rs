//! Per-tool detection knowledge: which strings and regexes mean "busy",
//! which mean "at a prompt", and which glyphs count as activity.

pub mod normalize;
pub mod prompt;
pub mod spinner;

use regex::Regex;
use tracing::warn;

use crate::domain::tool::Tool;
use spinner::{BRAILLE_DOTS, CLAUDE_ACTIVE_GLYPHS, OPENCODE_BLOCKS};

/// Prefix marking a configured pattern as a regex instead of a substring.
pub const REGEX_PREFIX: &str = "re:";

/// Raw, uncompiled patterns for one tool. This is the shape users override
/// in config; `None` means "keep the defaults", an empty list means
/// "replace the defaults with nothing".
#[derive(Debug, Clone, Default)]
pub struct RawPatterns {
    pub busy_patterns: Option<Vec<String>>,
    pub prompt_patterns: Option<Vec<String>>,
    pub spinner_chars: Option<Vec<char>>,
    pub whimsical_words: Option<Vec<String>>,
    pub extra_busy_patterns: Vec<String>,
    pub extra_prompt_patterns: Vec<String>,
    pub extra_spinner_chars: Vec<char>,
}

/// Built-in patterns for a tool. Every entry here is load-bearing; the
/// classifier's guards reference these exact strings.
pub fn default_raw(tool: &Tool) -> RawPatterns {
    match tool {
        Tool::Claude => RawPatterns {
            busy_patterns: Some(vec![
                // Asterisk spinner line: "✳ Gusting… (35s · ↑ 673 tokens)"
                r"re:(?m)^[✳✽✶✻✢·]\s*.+…".to_string(),
                "ctrl+c to interrupt".to_string(),
                "esc to interrupt".to_string(),
            ]),
            prompt_patterns: Some(vec![]),
            spinner_chars: Some(
                BRAILLE_DOTS
                    .iter()
                    .chain(CLAUDE_ACTIVE_GLYPHS.iter())
                    .copied()
                    .collect(),
            ),
            whimsical_words: Some(
                [
                    "Thinking",
                    "Pondering",
                    "Brewing",
                    "Gusting",
                    "Vibing",
                    "Computing",
                    "Reticulating",
                    "Simmering",
                    "Noodling",
                    "Percolating",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            ..Default::default()
        },
        Tool::Gemini => RawPatterns {
            busy_patterns: Some(vec!["esc to cancel".to_string()]),
            prompt_patterns: Some(vec![
                "gemini>".to_string(),
                "Type your message".to_string(),
            ]),
            ..Default::default()
        },
        Tool::Opencode => RawPatterns {
            busy_patterns: Some(
                [
                    "esc interrupt",
                    "esc to exit",
                    "thinking...",
                    "generating...",
                    "building tool call...",
                    "waiting for tool response...",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            prompt_patterns: Some(vec![
                "Ask anything".to_string(),
                "press enter to send".to_string(),
            ]),
            spinner_chars: Some(OPENCODE_BLOCKS.to_vec()),
            ..Default::default()
        },
        Tool::Codex => RawPatterns {
            busy_patterns: Some(vec![
                "ctrl+c to interrupt".to_string(),
                "esc to interrupt".to_string(),
                "press esc to interrupt".to_string(),
            ]),
            prompt_patterns: Some(vec![
                "How can I help".to_string(),
                "codex>".to_string(),
                "Continue?".to_string(),
            ]),
            ..Default::default()
        },
        // Shell and custom tools: no busy evidence, shell prompts only.
        Tool::Shell | Tool::Custom(_) => RawPatterns {
            busy_patterns: Some(vec![]),
            prompt_patterns: Some(vec!["$ ".to_string(), "# ".to_string(), "% ".to_string()]),
            ..Default::default()
        },
    }
}

/// Merge user overrides into defaults: a present override slice *replaces*
/// (even when empty), extras always append.
pub fn merge(defaults: RawPatterns, overrides: &RawPatterns) -> RawPatterns {
    let mut merged = RawPatterns {
        busy_patterns: overrides
            .busy_patterns
            .clone()
            .or(defaults.busy_patterns),
        prompt_patterns: overrides
            .prompt_patterns
            .clone()
            .or(defaults.prompt_patterns),
        spinner_chars: overrides.spinner_chars.clone().or(defaults.spinner_chars),
        whimsical_words: overrides
            .whimsical_words
            .clone()
            .or(defaults.whimsical_words),
        ..Default::default()
    };
    merged
        .busy_patterns
        .get_or_insert_with(Vec::new)
        .extend(overrides.extra_busy_patterns.iter().cloned());
    merged
        .prompt_patterns
        .get_or_insert_with(Vec::new)
        .extend(overrides.extra_prompt_patterns.iter().cloned());
    merged
        .spinner_chars
        .get_or_insert_with(Vec::new)
        .extend(overrides.extra_spinner_chars.iter().copied());
    merged
}

/// Compiled matcher set for one tool.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPatterns {
    pub busy_strings: Vec<String>,
    pub busy_regexps: Vec<Regex>,
    pub prompt_strings: Vec<String>,
    pub prompt_regexps: Vec<Regex>,
    pub spinner_chars: Vec<char>,
    /// spinner + whimsical word + parenthesized status
    pub thinking: Option<Regex>,
    /// spinner + any text + `…` + `(...)`
    pub thinking_ellipsis: Option<Regex>,
    /// spinner + any text + `…`
    pub spinner_active: Option<Regex>,
}

impl ResolvedPatterns {
    pub fn has_spinner(&self, c: char) -> bool {
        self.spinner_chars.contains(&c)
    }
}

/// Compile raw patterns. A user pattern that fails to compile is logged
/// and skipped; the rest of the set stays usable.
pub fn compile(raw: &RawPatterns) -> ResolvedPatterns {
    let mut resolved = ResolvedPatterns::default();

    for pat in raw.busy_patterns.iter().flatten() {
        split_pattern(pat, &mut resolved.busy_strings, &mut resolved.busy_regexps);
    }
    for pat in raw.prompt_patterns.iter().flatten() {
        split_pattern(
            pat,
            &mut resolved.prompt_strings,
            &mut resolved.prompt_regexps,
        );
    }
    resolved.spinner_chars = raw.spinner_chars.clone().unwrap_or_default();

    if !resolved.spinner_chars.is_empty() {
        let class = spinner_class(&resolved.spinner_chars);
        if let Some(words) = raw.whimsical_words.as_ref().filter(|w| !w.is_empty()) {
            let escaped: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
            let pattern = format!(r"{class}\s*(?:{})\S*\s*\([^)]*\)", escaped.join("|"));
            resolved.thinking = try_compile(&pattern);
        }
        resolved.thinking_ellipsis = try_compile(&format!(r"{class}\s*.+…\s*\([^)]*\)"));
        resolved.spinner_active = try_compile(&format!(r"{class}\s*.+…"));
    }

    resolved
}

/// Compile the full default set for a tool.
pub fn resolve_for_tool(tool: &Tool, overrides: Option<&RawPatterns>) -> ResolvedPatterns {
    let defaults = default_raw(tool);
    match overrides {
        Some(o) => compile(&merge(defaults, o)),
        None => compile(&defaults),
    }
}

fn split_pattern(pat: &str, strings: &mut Vec<String>, regexps: &mut Vec<Regex>) {
    if let Some(expr) = pat.strip_prefix(REGEX_PREFIX) {
        if let Some(re) = try_compile(expr) {
            regexps.push(re);
        }
    } else {
        strings.push(pat.to_string());
    }
}

fn try_compile(expr: &str) -> Option<Regex> {
    match Regex::new(expr) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = expr, error = %e, "invalid pattern regex, skipping");
            None
        }
    }
}

/// Build a character class matching any of the given spinner glyphs.
fn spinner_class(chars: &[char]) -> String {
    let mut class = String::from("[");
    for &c in chars {
        // Escape the handful of metacharacters meaningful inside a class.
        if matches!(c, '\\' | ']' | '^' | '-' | '[') {
            class.push('\\');
        }
        class.push(c);
    }
    class.push(']');
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_compile_for_all_builtin_tools() {
        for key in Tool::builtin_keys() {
            let tool: Tool = key.to_string().into();
            let resolved = compile(&default_raw(&tool));
            // Matchers reject an empty string.
            assert!(!is_any_match(&resolved, ""));
        }
    }

    fn is_any_match(r: &ResolvedPatterns, content: &str) -> bool {
        r.busy_strings.iter().any(|s| content.contains(s))
            || r.busy_regexps.iter().any(|re| re.is_match(content))
    }

    #[test]
    fn test_claude_busy_regex_matches_spinner_line() {
        let resolved = compile(&default_raw(&Tool::Claude));
        let content = "✳ Gusting… (35s · ↑ 673 tokens)\n❯\n";
        assert!(resolved.busy_regexps.iter().any(|re| re.is_match(content)));
    }

    #[test]
    fn test_claude_spinner_set_excludes_done_glyphs() {
        let resolved = compile(&default_raw(&Tool::Claude));
        assert!(resolved.has_spinner('⠙'));
        assert!(resolved.has_spinner('✳'));
        assert!(!resolved.has_spinner('✻'));
        assert!(!resolved.has_spinner('·'));
    }

    #[test]
    fn test_opencode_busy_strings() {
        let resolved = compile(&default_raw(&Tool::Opencode));
        assert!(is_any_match(&resolved, "⬝ thinking..."));
        assert!(resolved.has_spinner('█'));
    }

    #[test]
    fn test_merge_override_replaces_even_when_empty() {
        let overrides = RawPatterns {
            busy_patterns: Some(vec![]),
            ..Default::default()
        };
        let merged = merge(default_raw(&Tool::Codex), &overrides);
        assert_eq!(merged.busy_patterns.as_deref(), Some(&[][..]));
        // Prompt patterns untouched.
        assert!(!merged.prompt_patterns.unwrap().is_empty());
    }

    #[test]
    fn test_merge_extras_append() {
        let overrides = RawPatterns {
            extra_busy_patterns: vec!["custom busy".to_string()],
            extra_spinner_chars: vec!['◐'],
            ..Default::default()
        };
        let merged = merge(default_raw(&Tool::Gemini), &overrides);
        let busy = merged.busy_patterns.unwrap();
        assert!(busy.contains(&"esc to cancel".to_string()));
        assert!(busy.contains(&"custom busy".to_string()));
        assert!(merged.spinner_chars.unwrap().contains(&'◐'));
    }

    #[test]
    fn test_invalid_regex_skipped_not_fatal() {
        let raw = RawPatterns {
            busy_patterns: Some(vec![
                "re:[unclosed".to_string(),
                "still works".to_string(),
            ]),
            ..Default::default()
        };
        let resolved = compile(&raw);
        assert!(resolved.busy_regexps.is_empty());
        assert_eq!(resolved.busy_strings, vec!["still works".to_string()]);
    }

    #[test]
    fn test_synthesized_patterns() {
        let resolved = compile(&default_raw(&Tool::Claude));
        let thinking = resolved.thinking.as_ref().unwrap();
        assert!(thinking.is_match("⠙ Pondering (3s · 120 tokens)"));
        let ellipsis = resolved.thinking_ellipsis.as_ref().unwrap();
        assert!(ellipsis.is_match("✳ Doing something… (3s)"));
        let active = resolved.spinner_active.as_ref().unwrap();
        assert!(active.is_match("⠦ Editing file…"));
        assert!(!active.is_match("nothing here"));
    }
}
