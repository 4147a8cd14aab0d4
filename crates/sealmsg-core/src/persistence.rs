//! Key-value persistence for the three engine documents.
//!
//! Backends only move bytes; they know nothing about messages. Each document
//! is written as a full overwrite, so a save can be repeated safely.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::PersistenceError;
use crate::ledger::HiddenLedger;
use crate::models::{Chat, HiddenLedgerEntry, Message};
use crate::store::MessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    MessagesByChat,
    Chats,
    HiddenLedger,
}

impl Document {
    pub const ALL: [Document; 3] = [
        Document::MessagesByChat,
        Document::Chats,
        Document::HiddenLedger,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Document::MessagesByChat => "messages-by-chat",
            Document::Chats => "chats",
            Document::HiddenLedger => "hidden-ledger",
        }
    }
}

pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when the document has never been saved.
    fn load(&self, doc: Document) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn save(&self, doc: Document, bytes: &[u8]) -> Result<(), PersistenceError>;
}

/// Serialised form of all three documents, taken under the engine's write
/// guard and written after it is released.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub documents: Vec<(Document, Vec<u8>)>,
}

impl Snapshot {
    pub fn capture(
        generation: u64,
        store: &MessageStore,
        ledger: &HiddenLedger,
    ) -> Result<Self, PersistenceError> {
        Ok(Self {
            generation,
            documents: vec![
                (Document::MessagesByChat, serde_json::to_vec(store.messages_by_chat())?),
                (Document::Chats, serde_json::to_vec(store.chats())?),
                (Document::HiddenLedger, serde_json::to_vec(ledger.as_document())?),
            ],
        })
    }

    pub fn write_to(&self, backend: &dyn SnapshotStore) -> Result<(), PersistenceError> {
        for (doc, bytes) in &self.documents {
            backend.save(*doc, bytes)?;
        }
        Ok(())
    }
}

/// Everything the engine restores at startup.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub store: MessageStore,
    pub ledger: HiddenLedger,
    /// Hidden messages that had no ledger entry and were given one.
    pub reconciled: usize,
}

/// Load all documents. Missing or unreadable ones start empty.
pub fn load_state(backend: &dyn SnapshotStore) -> LoadedState {
    let messages: BTreeMap<String, Vec<Message>> =
        load_document(backend, Document::MessagesByChat);
    let chats: Vec<Chat> = load_document(backend, Document::Chats);
    let ledger_doc: BTreeMap<String, Vec<HiddenLedgerEntry>> =
        load_document(backend, Document::HiddenLedger);

    let store = MessageStore::from_parts(chats, messages);
    let mut ledger = HiddenLedger::from_document(ledger_doc);

    // A torn write can leave a hidden message without its entry.
    let mut reconciled = 0;
    for message in store.hidden_messages() {
        if !ledger.contains(&message.id) {
            let hidden_at = message.hide_at.unwrap_or(message.created_at);
            ledger.append(message.clone(), hidden_at);
            reconciled += 1;
        }
    }
    if reconciled > 0 {
        warn!(count = reconciled, "restored missing hidden-ledger entries");
    }
    LoadedState {
        store,
        ledger,
        reconciled,
    }
}

pub fn load_document<T: DeserializeOwned + Default>(
    backend: &dyn SnapshotStore,
    doc: Document,
) -> T {
    match backend.load(doc) {
        Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!(document = doc.key(), error = %err, "malformed document; starting empty");
            T::default()
        }),
        Ok(None) => T::default(),
        Err(err) => {
            warn!(document = doc.key(), error = %err, "document unreadable; starting empty");
            T::default()
        }
    }
}

pub fn save_document<T: Serialize + ?Sized>(
    backend: &dyn SnapshotStore,
    doc: Document,
    value: &T,
) -> Result<(), PersistenceError> {
    let data = serde_json::to_vec(value)?;
    backend.save(doc, &data)
}

/// In-process backend. Documents can be made to fail for tests of the
/// recovery path.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    docs: Mutex<HashMap<Document, Vec<u8>>>,
    failing: Mutex<HashSet<Document>>,
    saves: Mutex<u64>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.extend(Document::ALL);
        } else {
            failing.clear();
        }
    }

    pub fn fail_document(&self, doc: Document) {
        self.failing.lock().insert(doc);
    }

    pub fn raw(&self, doc: Document) -> Option<Vec<u8>> {
        self.docs.lock().get(&doc).cloned()
    }

    pub fn put_raw(&self, doc: Document, bytes: &[u8]) {
        self.docs.lock().insert(doc, bytes.to_vec());
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, doc: Document) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.docs.lock().get(&doc).cloned())
    }

    fn save(&self, doc: Document, bytes: &[u8]) -> Result<(), PersistenceError> {
        if self.failing.lock().contains(&doc) {
            return Err(PersistenceError::Backend(format!("{} unavailable", doc.key())));
        }
        self.docs.lock().insert(doc, bytes.to_vec());
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// One `<key>.json` file per document inside `dir`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, doc: Document) -> PathBuf {
        self.dir.join(format!("{}.json", doc.key()))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, doc: Document) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(self.path_for(doc)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, doc: Document, bytes: &[u8]) -> Result<(), PersistenceError> {
        // Write beside the target and rename so readers never see half a file.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(self.path_for(doc))
            .map_err(|e| PersistenceError::Io(e.error))?;
        Ok(())
    }
}
