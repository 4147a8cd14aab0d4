//! Records owned by the message store and the hidden ledger.
//!
//! Everything here serialises with `camelCase` field names; the persisted
//! documents are plain JSON of these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access_gate::SecondaryCredential;

/// The logged-in user for the current session. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub secondary_credential: SecondaryCredential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub participant_id: String,
    pub participant_name: String,
    #[serde(default)]
    pub last_message_text: String,
}

impl Chat {
    pub fn new(
        id: impl Into<String>,
        participant_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            participant_id: participant_id.into(),
            participant_name: name.into(),
            last_message_text: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub text: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: DateTime<Utc>,
    /// Absent for permanent messages; those never leave `Visible`.
    #[serde(default)]
    pub hide_at: Option<DateTime<Utc>>,
    pub visibility: Visibility,
}

impl Message {
    pub fn is_hidden(&self) -> bool {
        self.visibility == Visibility::Hidden
    }

    /// Due when a timer is set and `hide_at <= now`. Equality counts.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.visibility == Visibility::Visible && self.hide_at.is_some_and(|at| at <= now)
    }

    /// The sender always sees their own messages; everyone else only
    /// sees visible ones.
    pub fn is_visible_to(&self, viewer_id: &str) -> bool {
        self.sender_id == viewer_id || self.visibility == Visibility::Visible
    }
}

/// Copy of a message taken when it became hidden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HiddenLedgerEntry {
    pub message: Message,
    pub hidden_at: DateTime<Utc>,
}

/// One counterpart's slice of the hidden section, as served to the sender.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HiddenConversation {
    pub receiver_id: String,
    /// `None` when no chat with this participant is registered.
    pub participant_name: Option<String>,
    pub entries: Vec<HiddenLedgerEntry>,
}
