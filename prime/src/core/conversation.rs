//! Per-task conversation history and the window sent to the model.

use serde::{Deserialize, Serialize};

use crate::core::truncate::truncate_middle;

/// Inserted after the first message when older turns were dropped.
pub const TRUNCATION_NOTICE: &str =
    "Note: Earlier conversation history was truncated due to length.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimits {
    pub max_messages: usize,
    pub char_budget: usize,
    pub per_message_chars: usize,
}

/// Select the history sent with the next prompt.
///
/// Keeps the most recent `max_messages` messages that fit in `char_budget`,
/// always keeps the first message (the goal framing), and inserts
/// [`TRUNCATION_NOTICE`] when anything in between was dropped. Each message
/// is capped at `per_message_chars` first.
pub fn window(messages: &[ChatMessage], limits: WindowLimits) -> Vec<ChatMessage> {
    let capped: Vec<ChatMessage> = messages
        .iter()
        .map(|msg| ChatMessage {
            role: msg.role,
            content: truncate_middle(&msg.content, limits.per_message_chars, "message").text,
        })
        .collect();
    let Some((first, rest)) = capped.split_first() else {
        return Vec::new();
    };

    let mut budget = limits.char_budget.saturating_sub(first.content.chars().count());
    let max_rest = limits.max_messages.saturating_sub(1);
    let mut kept: Vec<&ChatMessage> = Vec::new();
    for msg in rest.iter().rev() {
        if kept.len() >= max_rest {
            break;
        }
        let len = msg.content.chars().count();
        if len > budget {
            break;
        }
        budget -= len;
        kept.push(msg);
    }
    kept.reverse();

    let dropped = rest.len() - kept.len();
    let mut out = Vec::with_capacity(kept.len() + 2);
    out.push(first.clone());
    if dropped > 0 {
        out.push(ChatMessage::user(TRUNCATION_NOTICE));
    }
    out.extend(kept.into_iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_messages: usize, char_budget: usize) -> WindowLimits {
        WindowLimits {
            max_messages,
            char_budget,
            per_message_chars: 1_000,
        }
    }

    fn convo(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("u{i}"))
                } else {
                    ChatMessage::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    #[test]
    fn short_history_is_passed_through() {
        let messages = convo(4);
        assert_eq!(window(&messages, limits(10, 10_000)), messages);
    }

    #[test]
    fn long_history_keeps_first_and_most_recent() {
        let messages = convo(15);
        let out = window(&messages, limits(10, 10_000));
        assert_eq!(out[0].content, "u0");
        assert_eq!(out[1].content, TRUNCATION_NOTICE);
        assert_eq!(out.len(), 11);
        assert_eq!(out.last().map(|m| m.content.as_str()), Some("u14"));
        assert_eq!(out[2].content, "u6");
    }

    #[test]
    fn char_budget_drops_older_messages() {
        let messages = vec![
            ChatMessage::user("goal"),
            ChatMessage::assistant("x".repeat(50)),
            ChatMessage::user("y".repeat(50)),
        ];
        let out = window(&messages, limits(10, 60));
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].content, TRUNCATION_NOTICE);
        assert_eq!(out[2].content, "y".repeat(50));
    }

    #[test]
    fn empty_history_is_empty() {
        assert!(window(&[], limits(10, 100)).is_empty());
    }
}
