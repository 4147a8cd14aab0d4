//! sealmsg-core: data model and building blocks of the ephemeral-message
//! engine.
//!
//! Messages may carry a hide timer. Once it elapses the message disappears
//! for everyone but its sender, and a copy lands in the hidden ledger, which
//! only opens after a secondary credential check.

pub mod access_gate;
pub mod chat_index;
pub mod clock;
pub mod error;
pub mod event_log;
pub mod ledger;
pub mod models;
pub mod paths;
pub mod persistence;
pub mod settings;
pub mod store;

pub use access_gate::{verify_secondary, SecondaryCredential};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, PersistenceError, SettingsError};
pub use event_log::{EventLog, EventSeverity, EventSink, TracingEventSink};
pub use ledger::HiddenLedger;
pub use models::{Chat, HiddenConversation, HiddenLedgerEntry, Identity, Message, Visibility};
pub use persistence::{Document, FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use settings::EngineSettings;
pub use store::MessageStore;
