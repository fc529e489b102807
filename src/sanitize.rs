use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Entire lines that leak a role tag out of the prompt format.
    static ref TAG_LINE: Regex =
        Regex::new(r"(?im)^\s*\[(?:SYSTEM|CONTEXT|USER|ASSISTANT)\].*$").unwrap();
    // Conversational openers the model likes to prepend. The punctuation
    // class includes '.' so a doubled preamble ("Sure. Here's:") strips
    // fully across the two passes.
    static ref LEAD_IN: Regex = Regex::new(
        r"(?i)^\s*(?:sure|okay|ok|of course|here['’]?s|here\s+(?:is|are)|below\s+(?:is|are)|the\s+revised\s+version|revised\s+version|dưới\s+đây\s+là|sau\s+đây\s+là|đây\s+là)\s*[:\-–.,]?\s*"
    )
    .unwrap();
}

/// Strip leaked role-tag lines and generic lead-in phrases from generated
/// text. Pure function; empty input yields empty output.
pub fn clean(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    text = TAG_LINE.replace_all(&text, "").trim().to_string();
    // Two passes: one per stacked opener.
    for _ in 0..2 {
        text = LEAD_IN.replace(&text, "").trim().to_string();
    }
    text
}
