//! Telegram HTML formatting helpers.
//!
//! Backend output arrives as a small markdown subset (fenced code blocks,
//! inline code, bold/italic/strikethrough). Telegram wants its own HTML
//! flavor, so [`to_html`] escapes everything outside code runs and rewrites
//! the markers. Splitting is rune-based because Telegram's 4096 limit counts
//! characters, not bytes.

use std::sync::OnceLock;

use regex::Regex;

/// Telegram's hard per-message character limit.
pub const MESSAGE_LIMIT: usize = 4096;

/// Escape `& < >` for embedding in Telegram HTML.
#[must_use]
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(\w*)\n(.*?)```").expect("code block regex"))
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`]+)`").expect("inline code regex"))
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*]+)\*\*").expect("bold regex"))
}

fn italic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*([^*]+)\*").expect("italic regex"))
}

fn strike_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"~~([^~]+)~~").expect("strike regex"))
}

/// Convert the markdown subset emitted by coding agents to Telegram HTML.
///
/// Code runs are lifted out first (so their contents are escaped but not
/// styled), the remaining text is HTML-escaped, the `**`/`*`/`~~` markers are
/// rewritten, and the code runs are stitched back in.
#[must_use]
pub fn to_html(text: &str) -> String {
    // Placeholders use NUL delimiters, which cannot occur in Telegram text.
    let mut code_blocks = Vec::new();
    let text = code_block_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let lang = &caps[1];
            let code = escape_html(&caps[2]);
            let html = if lang.is_empty() {
                format!("<pre><code>{code}</code></pre>")
            } else {
                format!("<pre><code class=\"language-{lang}\">{code}</code></pre>")
            };
            let placeholder = format!("\x00CB{}\x00", code_blocks.len());
            code_blocks.push(html);
            placeholder
        })
        .into_owned();

    let mut inline_codes = Vec::new();
    let text = inline_code_re()
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            let html = format!("<code>{}</code>", escape_html(&caps[1]));
            let placeholder = format!("\x00IC{}\x00", inline_codes.len());
            inline_codes.push(html);
            placeholder
        })
        .into_owned();

    let text = escape_html(&text);
    let text = bold_re().replace_all(&text, "<b>$1</b>");
    let text = italic_re().replace_all(&text, "<i>$1</i>");
    let mut text = strike_re().replace_all(&text, "<s>$1</s>").into_owned();

    for (i, html) in inline_codes.iter().enumerate() {
        text = text.replace(&format!("\x00IC{i}\x00"), html);
    }
    for (i, html) in code_blocks.iter().enumerate() {
        text = text.replace(&format!("\x00CB{i}\x00"), html);
    }

    text
}

/// Number of runes (chars) in `s`.
#[must_use]
pub fn rune_count(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of the `n`-th rune in `s`; `len()` when `n` exceeds the count.
#[must_use]
pub fn rune_byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

/// First `n` runes of `s`.
#[must_use]
pub fn truncate_runes(s: &str, n: usize) -> &str {
    &s[..rune_byte_offset(s, n)]
}

/// Split `text` into chunks of at most `max_runes` runes, preferring to break
/// after a code fence past the halfway point, then at a newline past the
/// halfway point, then hard at the rune boundary.
#[must_use]
pub fn split_message(text: &str, max_runes: usize) -> Vec<String> {
    if rune_count(text) <= max_runes {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rune_count(rest) > max_runes {
        let split = find_split_point(rest, max_runes);
        chunks.push(rest[..split].to_string());
        rest = &rest[split..];
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Byte index to split at so the prefix holds at most `max_runes` runes.
fn find_split_point(text: &str, max_runes: usize) -> usize {
    let byte_limit = rune_byte_offset(text, max_runes);
    if byte_limit >= text.len() {
        return text.len();
    }
    let prefix = &text[..byte_limit];

    if let Some(fence) = prefix.rfind("```") {
        if fence > byte_limit / 2 {
            // Break on the line after the fence so the marker stays intact.
            return match text[fence..].find('\n') {
                Some(nl) => fence + nl + 1,
                None => fence,
            };
        }
    }

    if let Some(nl) = prefix.rfind('\n') {
        if nl > byte_limit / 2 {
            return nl + 1;
        }
    }

    byte_limit
}
