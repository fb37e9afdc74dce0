//! Strips internal "thinking" markers and simulated tool-call text from
//! assistant content before persistence/emission (spec §4.8, tag set
//! fixed by spec §6).
//!
//! Sanitization is idempotent: running it twice produces the same output
//! as running it once, since every pattern it removes is gone after the
//! first pass and nothing it leaves behind looks like a fresh match.

use regex::Regex;
use std::sync::OnceLock;

/// One block-stripping rule: everything from `open` up to and including
/// the first following `close` is removed. `close: None` means "strip to
/// end of content" (used for an unterminated block a model sometimes
/// emits when cut off mid-thought).
struct TagRule {
    open: &'static str,
    close: Option<&'static str>,
}

const BLOCK_RULES: &[TagRule] = &[
    TagRule { open: "<thinking>", close: Some("</thinking>") },
    TagRule { open: "<think>", close: Some("</think>") },
    TagRule { open: "<reasoning>", close: Some("</reasoning>") },
];

fn invoke_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Stray `<invoke ...>...</invoke>` blocks that weren't parsed into
        // structured tool_calls by the adapter — vendor-specific markers
        // that leaked into plain text rather than the tool-call channel.
        Regex::new(r"(?s)<invoke\b[^>]*>.*?</invoke>").expect("static regex is valid")
    })
}

fn xml_declaration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*<\?xml[^>]*\?>\s*").expect("static regex is valid"))
}

fn strip_blocks(mut text: String) -> String {
    for rule in BLOCK_RULES {
        loop {
            let Some(start) = text.find(rule.open) else { break };
            let after_open = start + rule.open.len();
            match rule.close.and_then(|close| text[after_open..].find(close).map(|pos| after_open + pos + close.len())) {
                Some(end) => {
                    text.replace_range(start..end, "");
                }
                None => {
                    // Unterminated block: drop to end of content rather
                    // than looping forever on an `open` that never closes.
                    text.truncate(start);
                    break;
                }
            }
        }
    }
    text
}

/// Strip the fixed tag set from assistant content (spec §6): thinking/
/// reasoning blocks, stray `<invoke>` wrappers outside structured
/// `tool_calls`, and a leading XML declaration.
pub fn sanitize(content: &str) -> String {
    let without_blocks = strip_blocks(content.to_string());
    let without_invokes = invoke_pattern().replace_all(&without_blocks, "").into_owned();
    let without_xml_decl = xml_declaration_pattern().replace(&without_invokes, "").into_owned();
    without_xml_decl.trim().to_string()
}
