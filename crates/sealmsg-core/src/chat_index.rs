//! Searchable chat list derived from the message store on every call.

use crate::models::Chat;
use crate::store::MessageStore;

/// Chats in registration order, optionally filtered by a case-insensitive
/// substring of the participant name. A blank term filters nothing.
pub fn list_chats(store: &MessageStore, search: Option<&str>) -> Vec<Chat> {
    let needle = search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);
    store
        .chats()
        .iter()
        .filter(|chat| match &needle {
            Some(n) => chat.participant_name.to_lowercase().contains(n.as_str()),
            None => true,
        })
        .cloned()
        .collect()
}

/// Display name of the chat whose participant is `participant_id`.
pub fn participant_name(store: &MessageStore, participant_id: &str) -> Option<String> {
    store
        .chats()
        .iter()
        .find(|c| c.participant_id == participant_id)
        .map(|c| c.participant_name.clone())
}
