//! Conversation normalization for backends with a narrower role vocabulary

use super::{ChatMessage, Role};

/// Join all system messages, in order, with a blank line between them
pub fn system_text(messages: &[ChatMessage]) -> Option<String> {
    let parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Fold system messages into the first user turn.
///
/// For backends without a system role. The system text is prepended to the
/// first user message separated by a blank line; if there is no user turn,
/// one is created at the front holding only the system text.
pub fn merge_system_into_first_user(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut turns: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let Some(system) = system_text(messages) else {
        return turns;
    };

    match turns.iter_mut().find(|m| m.role == Role::User) {
        Some(first_user) => {
            first_user.content = format!("{}\n\n{}", system, first_user.content);
        }
        None => turns.insert(0, ChatMessage::user(system)),
    }
    turns
}

/// Make a chat history start with a user-authored turn.
///
/// A lone non-user turn is dropped. Longer histories are rebuilt by
/// interleaving user and non-user turns, each group keeping its relative
/// order. With no user turn at all the history is discarded.
pub fn repair_history<T>(history: Vec<T>, is_user: impl Fn(&T) -> bool) -> Vec<T> {
    match history.first() {
        None => return history,
        Some(first) if is_user(first) => return history,
        Some(_) => {}
    }

    if history.len() == 1 {
        return Vec::new();
    }

    let (users, others): (Vec<T>, Vec<T>) = history.into_iter().partition(|turn| is_user(turn));
    if users.is_empty() {
        return Vec::new();
    }

    let mut repaired = Vec::with_capacity(users.len() + others.len());
    let mut users = users.into_iter();
    let mut others = others.into_iter();
    loop {
        let user = users.next();
        let other = others.next();
        if user.is_none() && other.is_none() {
            break;
        }
        repaired.extend(user);
        repaired.extend(other);
    }
    repaired
}
