//! Token estimates.
//!
//! Budgets are enforced with the same rough `bytes / 4` estimate the rest of the crate uses
//! for memory content. It is deterministic, which keeps context fitting reproducible.

use crate::chat::Chat;

/// Estimated token count of a text.
pub fn count_text(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimated token count of a chat turn, including any function invocation.
pub fn count_chat(chat: &Chat) -> usize {
    let mut tokens = count_text(chat.content());
    if let Some(call) = chat.function_call() {
        tokens += count_text(&call.name) + count_text(&call.arguments);
    }
    if let Chat::Function { name, .. } = chat {
        tokens += count_text(name);
    }
    tokens
}

/// Estimated token count of a flattened history.
pub fn count_chats(chats: &[Chat]) -> usize {
    chats.iter().map(count_chat).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(count_text(""), 0);
        assert_eq!(count_text("abc"), 1);
        assert_eq!(count_text("abcd"), 1);
        assert_eq!(count_text("abcde"), 2);
    }

    #[test]
    fn chats_sum() {
        let chats = vec![Chat::user("a".repeat(40)), Chat::assistant("b".repeat(8))];
        assert_eq!(count_chats(&chats), 12);
    }
}
