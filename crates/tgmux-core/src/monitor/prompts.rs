//! Interactive prompt detection.
//!
//! Backends sometimes stop and wait for keyboard input: permission dialogs
//! (`Allow? (y/n)`) or full-screen selectors (`❯` menus). Detecting these in
//! monitor output lets the bot offer an inline keyboard instead of leaving
//! the session stuck.

/// Phrases that indicate a permission-confirm dialog (matched
/// case-insensitively).
const CONFIRM_PATTERNS: [&str; 10] = [
    "allow",
    "deny",
    "(y/n)",
    "(y/N)",
    "(Y/n)",
    "(Y/N)",
    "do you want to proceed",
    "are you sure",
    "allow this",
    "approve this",
];

/// Literal markers used by interactive selector UIs.
const SELECTOR_MARKERS: [&str; 7] = ["❯", "●", "○", "◉", "[ ]", "[x]", "[X]"];

/// Phrases used by interactive selector UIs (matched case-insensitively).
const SELECTOR_PHRASES: [&str; 3] = ["use arrow", "tab to cycle", "esc to cancel"];

/// True when `text` looks like a yes/no permission prompt.
#[must_use]
pub fn detect_confirm_prompt(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONFIRM_PATTERNS
        .iter()
        .any(|p| lower.contains(&p.to_lowercase()))
}

/// True when `text` looks like an arrow-key selector.
#[must_use]
pub fn detect_interactive_ui(text: &str) -> bool {
    if SELECTOR_MARKERS.iter().any(|m| text.contains(m)) {
        return true;
    }
    let lower = text.to_lowercase();
    SELECTOR_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_yn_prompts() {
        assert!(detect_confirm_prompt("Proceed? (y/n)"));
        assert!(detect_confirm_prompt("Do you want to proceed?"));
        assert!(detect_confirm_prompt("ALLOW this command?"));
        assert!(detect_confirm_prompt("are you sure?"));
    }

    #[test]
    fn detects_selector_markers() {
        assert!(detect_interactive_ui("❯ Option A\n  Option B"));
        assert!(detect_interactive_ui("[x] done\n[ ] pending"));
        assert!(detect_interactive_ui("◉ selected"));
    }

    #[test]
    fn detects_selector_phrases() {
        assert!(detect_interactive_ui("Use arrow keys to navigate"));
        assert!(detect_interactive_ui("Tab to cycle, Esc to cancel"));
    }

    #[test]
    fn plain_output_matches_neither() {
        let text = "Compiling tgmux v0.3.0\nFinished in 2.1s";
        assert!(!detect_confirm_prompt(text));
        assert!(!detect_interactive_ui(text));
    }
}
