//! ChatML prompt framing.
//!
//! Qwen2-instruct models are trained on `<|im_start|>role\ncontent<|im_end|>`
//! turns; this module renders a conversation into that format and knows
//! which tokens end a turn.

/// One message in a chat-formatted conversation.
pub struct Message<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

/// Render a full conversation as ChatML text, ready for tokenization.
pub fn render(messages: &[Message<'_>]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str("<|im_start|>");
        out.push_str(msg.role);
        out.push('\n');
        out.push_str(msg.content.trim());
        out.push_str("<|im_end|>\n");
    }
    out
}

/// Render a conversation followed by an open `assistant` header, so the
/// model continues directly into its reply instead of restarting a turn.
pub fn render_with_assistant_header(messages: &[Message<'_>]) -> String {
    let mut out = render(messages);
    out.push_str("<|im_start|>assistant\n");
    out
}

/// Token strings that signal the end of an assistant turn. Both are
/// checked because some Qwen2 checkpoints emit `<|endoftext|>` instead
/// of the ChatML-specific `<|im_end|>` at the end of generation.
pub const STOP_SEQUENCES: &[&str] = &["<|im_end|>", "<|endoftext|>"];

pub fn is_stop_token(tokenizer: &crate::tokenizer::BpeTokenizer, id: u32) -> bool {
    id == tokenizer.im_end_id || id == tokenizer.endoftext_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_full_turns() {
        let messages = [Message { role: "system", content: "be terse" }, Message { role: "user", content: "hi" }];
        let rendered = render(&messages);
        assert_eq!(
            rendered,
            "<|im_start|>system\nbe terse<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n"
        );
    }

    #[test]
    fn header_only_variant_leaves_turn_open() {
        let messages = [Message { role: "user", content: "hi" }];
        let rendered = render_with_assistant_header(&messages);
        assert!(rendered.ends_with("<|im_start|>assistant\n"));
        assert!(!rendered.trim_end().ends_with("<|im_end|>"));
    }
}
