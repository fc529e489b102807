use anyhow::Result;
use log::debug;

use crate::model::{ModelBackend, TokenSequence};
use crate::web::models::{ContextItem, Message, Role};

/// Render retrieved snippets as a numbered block: `#1 <title>\n<text>`,
/// blank-line separated.
pub fn render_context(items: &[ContextItem]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("#{} {}\n{}", i + 1, item.title, item.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Assemble the role-tagged message list. Context travels as its own user
/// turn, never merged into the system prompt, so the model does not read
/// retrieved text as instructions.
pub fn build_messages(
    system: Option<&str>,
    context: &[ContextItem],
    user: &str,
) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        messages.push(Message {
            role: Role::System,
            content: system.to_string(),
        });
    }
    if !context.is_empty() {
        messages.push(Message {
            role: Role::User,
            content: format!(
                "CONTEXT:\n{}\n(use only if relevant)",
                render_context(context)
            ),
        });
    }
    messages.push(Message {
        role: Role::User,
        content: user.to_string(),
    });
    messages
}

/// Raw bracket-tag prompt used when the model has no usable chat template.
pub fn fallback_prompt(system: Option<&str>, context: &[ContextItem], user: &str) -> String {
    let mut parts = Vec::new();
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        parts.push(format!("<<SYS>>\n{}\n<</SYS>>", system));
    }
    if !context.is_empty() {
        parts.push(format!("[CONTEXT]\n{}\n", render_context(context)));
    }
    parts.push(format!("[INST] {} [/INST]", user));
    parts.join("\n\n")
}

/// Build the generation-ready token sequence. Structured templating is
/// preferred; any templating failure falls back to the bracket-tag prompt
/// and raw tokenization, and is never surfaced to the caller.
pub fn build_input_tokens(
    backend: &dyn ModelBackend,
    system: Option<&str>,
    context: &[ContextItem],
    user: &str,
) -> Result<TokenSequence> {
    let messages = build_messages(system, context, user);
    match backend.apply_template(&messages, true) {
        Ok(tokens) => Ok(tokens),
        Err(e) => {
            debug!("chat template unavailable, using raw prompt: {}", e);
            backend.tokenize(&fallback_prompt(system, context, user))
        }
    }
}
