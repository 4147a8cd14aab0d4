//! Append-only record of messages that went hidden, grouped by receiver.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

use crate::models::{HiddenLedgerEntry, Message};

#[derive(Debug, Default, Clone)]
pub struct HiddenLedger {
    by_receiver: BTreeMap<String, Vec<HiddenLedgerEntry>>,
    recorded: HashSet<String>,
}

impl HiddenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the persisted `hidden-ledger` document, dropping any
    /// repeated message ids.
    pub fn from_document(doc: BTreeMap<String, Vec<HiddenLedgerEntry>>) -> Self {
        let mut ledger = Self::new();
        for entry in doc.into_values().flatten() {
            let hidden_at = entry.hidden_at;
            ledger.append(entry.message, hidden_at);
        }
        ledger
    }

    /// Record `message` as hidden at `hidden_at`. Returns false if the
    /// message already has an entry.
    pub fn append(&mut self, message: Message, hidden_at: DateTime<Utc>) -> bool {
        if !self.recorded.insert(message.id.clone()) {
            return false;
        }
        self.by_receiver
            .entry(message.receiver_id.clone())
            .or_default()
            .push(HiddenLedgerEntry { message, hidden_at });
        true
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.recorded.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    pub fn entries_for_receiver(&self, receiver_id: &str) -> &[HiddenLedgerEntry] {
        self.by_receiver
            .get(receiver_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Entries whose message was sent by `sender_id`, keyed by receiver.
    pub fn sent_by(&self, sender_id: &str) -> BTreeMap<&str, Vec<&HiddenLedgerEntry>> {
        let mut out: BTreeMap<&str, Vec<&HiddenLedgerEntry>> = BTreeMap::new();
        for (receiver, entries) in &self.by_receiver {
            let mine: Vec<_> = entries
                .iter()
                .filter(|e| e.message.sender_id == sender_id)
                .collect();
            if !mine.is_empty() {
                out.insert(receiver.as_str(), mine);
            }
        }
        out
    }

    pub fn as_document(&self) -> &BTreeMap<String, Vec<HiddenLedgerEntry>> {
        &self.by_receiver
    }
}
