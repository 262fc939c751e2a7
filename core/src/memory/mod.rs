//! Bounded agent memories
//!
//! Two append-only logs with compress-on-overflow semantics: the
//! conversation log (user/assistant turns) and the tool log (call/result
//! pairs plus the last plan). When a log outgrows its token budget, the
//! oldest entries are folded into a rolling LLM-written summary and
//! discarded; the serialized log never exceeds its budget after an append
//! returns, except when the compressor itself fails (the failure is
//! logged and compression retries on the next append).

mod conversation;
mod tool;

pub use conversation::{ConversationEntry, ConversationMemory, Role};
pub use tool::{ToolMemory, ToolRecord};

/// Remove `<think>...</think>` reasoning wrappers some models emit.
///
/// Unterminated blocks swallow the rest of the text.
pub fn strip_think(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}
