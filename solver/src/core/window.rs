//! Budgeted request view over the session conversation.
//!
//! The stored transcript is never trimmed; only the copy sent to the provider is.

use tracing::debug;

use crate::core::types::{Message, Role};

/// Build the message list sent to the provider.
///
/// The first system message and the first user message are always kept. The
/// newest remaining messages are added while they fit `budget_bytes`; the most
/// recent message is kept even when it alone exceeds the budget. Omitted
/// messages are replaced by a single marker.
pub fn request_window(messages: &[Message], budget_bytes: usize) -> Vec<Message> {
    let total: usize = messages.iter().map(|m| m.content.len()).sum();
    if total <= budget_bytes {
        return messages.to_vec();
    }

    let pinned: Vec<usize> = [
        messages.iter().position(|m| m.role == Role::System),
        messages.iter().position(|m| m.role == Role::User),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut used: usize = pinned.iter().map(|&i| messages[i].content.len()).sum();
    let mut tail = Vec::new();
    for (idx, message) in messages.iter().enumerate().rev() {
        if pinned.contains(&idx) {
            continue;
        }
        let len = message.content.len();
        if !tail.is_empty() && used + len > budget_bytes {
            break;
        }
        used += len;
        tail.push(idx);
    }
    tail.reverse();

    let first_tail = tail.first().copied().unwrap_or(messages.len());
    let omitted = (0..first_tail).filter(|i| !pinned.contains(i)).count();

    let mut window: Vec<Message> = messages
        .iter()
        .enumerate()
        .filter(|(i, _)| pinned.contains(i) && *i < first_tail)
        .map(|(_, m)| m.clone())
        .collect();
    if omitted > 0 {
        debug!(omitted, budget_bytes, "trimmed request window");
        window.push(Message::user(format!(
            "[{omitted} earlier messages omitted to fit the context window]"
        )));
    }
    window.extend(
        messages
            .iter()
            .enumerate()
            .filter(|(i, _)| *i >= first_tail && (tail.contains(i) || pinned.contains(i)))
            .map(|(_, m)| m.clone()),
    );
    window
}
