//! Chats and their message sequences.
//!
//! `MessageStore` is a plain owned structure; callers provide the locking.
//! The engine keeps it behind a single write guard so a send and a sweep
//! can never interleave.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Chat, Message, Visibility};

#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    chats: Vec<Chat>,
    chat_index: HashMap<String, usize>,
    messages: BTreeMap<String, Vec<Message>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the persisted `chats` and `messages-by-chat` documents.
    /// Duplicate chat ids keep their first occurrence.
    pub fn from_parts(chats: Vec<Chat>, messages: BTreeMap<String, Vec<Message>>) -> Self {
        let mut store = Self {
            messages,
            ..Self::default()
        };
        for chat in chats {
            store.register_chat(chat);
        }
        store
    }

    /// Returns false when a chat with this id already exists.
    pub fn register_chat(&mut self, chat: Chat) -> bool {
        if self.chat_index.contains_key(&chat.id) {
            return false;
        }
        self.chat_index.insert(chat.id.clone(), self.chats.len());
        self.chats.push(chat);
        true
    }

    pub fn chat(&self, chat_id: &str) -> Option<&Chat> {
        self.chat_index.get(chat_id).map(|&i| &self.chats[i])
    }

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn messages_by_chat(&self) -> &BTreeMap<String, Vec<Message>> {
        &self.messages
    }

    /// Append a new visible message and update the chat's preview text.
    ///
    /// A zero `hide_after` means no timer.
    pub fn send_message(
        &mut self,
        chat_id: &str,
        sender_id: &str,
        receiver_id: &str,
        text: &str,
        hide_after: Option<std::time::Duration>,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let idx = *self
            .chat_index
            .get(chat_id)
            .ok_or_else(|| EngineError::UnknownChat(chat_id.to_string()))?;
        if text.trim().is_empty() {
            return Err(EngineError::EmptyText);
        }
        let hide_at = match hide_after.filter(|d| !d.is_zero()) {
            Some(delay) => Some(hide_deadline(now, delay)?),
            None => None,
        };

        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            created_at: now,
            hide_at,
            visibility: Visibility::Visible,
        };
        self.messages
            .entry(chat_id.to_string())
            .or_default()
            .push(message.clone());
        self.chats[idx].last_message_text = text.to_string();
        Ok(message)
    }

    /// Append an already-formed message, e.g. imported history. The chat
    /// preview is left alone. Returns false if the id is already stored.
    pub fn insert_message(&mut self, message: Message) -> Result<bool> {
        if !self.chat_index.contains_key(&message.chat_id) {
            return Err(EngineError::UnknownChat(message.chat_id));
        }
        if self.messages.values().flatten().any(|m| m.id == message.id) {
            return Ok(false);
        }
        self.messages
            .entry(message.chat_id.clone())
            .or_default()
            .push(message);
        Ok(true)
    }

    /// Every message of the chat in insertion order, whatever its visibility.
    pub fn messages_for_chat(&self, chat_id: &str) -> Vec<Message> {
        self.messages.get(chat_id).cloned().unwrap_or_default()
    }

    /// Flip every due message to `Hidden` and return exactly those.
    ///
    /// A message is returned by at most one call: once hidden it is no
    /// longer due.
    pub fn transition_due(&mut self, now: DateTime<Utc>) -> Vec<Message> {
        let mut flipped = Vec::new();
        for message in self.messages.values_mut().flatten() {
            if message.is_due(now) {
                message.visibility = Visibility::Hidden;
                flipped.push(message.clone());
            }
        }
        if !flipped.is_empty() {
            debug!(count = flipped.len(), "messages transitioned to hidden");
        }
        flipped
    }

    /// All hidden messages, chat by chat.
    pub fn hidden_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values().flatten().filter(|m| m.is_hidden())
    }
}

/// `now + delay`, or `HideDelayTooLong` when that instant is not
/// representable.
fn hide_deadline(now: DateTime<Utc>, delay: std::time::Duration) -> Result<DateTime<Utc>> {
    let too_long = || EngineError::HideDelayTooLong {
        requested_secs: delay.as_secs(),
        max_secs: (DateTime::<Utc>::MAX_UTC.timestamp() - now.timestamp()).max(0) as u64,
    };
    let delay = Duration::from_std(delay).map_err(|_| too_long())?;
    now.checked_add_signed(delay).ok_or_else(too_long)
}
