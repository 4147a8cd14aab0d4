//! Composition root: owns the message store, the hidden ledger, the access
//! gate session and the sweeper.
//!
//! All mutation takes the single write guard on [`EngineState`]. The
//! snapshot is serialised under that guard and written after it is
//! released, so storage latency never blocks the next send or sweep.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use sealmsg_core::access_gate::verify_secondary;
use sealmsg_core::chat_index;
use sealmsg_core::error::{EngineError, PersistenceError, Result, SettingsError};
use sealmsg_core::event_log::{EventSeverity, EventSink, TracingEventSink};
use sealmsg_core::persistence::{load_state, Snapshot, SnapshotStore};
use sealmsg_core::{
    Chat, Clock, EngineSettings, HiddenConversation, HiddenLedger, Identity, Message,
    MessageStore, SystemClock,
};

use crate::sweeper::{spawn_sweeper, SweeperHandle};

pub struct EngineConfig {
    pub identity: Identity,
    pub settings: EngineSettings,
    pub persistence: Arc<dyn SnapshotStore>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

impl EngineConfig {
    pub fn new(identity: Identity, persistence: Arc<dyn SnapshotStore>) -> Self {
        Self {
            identity,
            settings: EngineSettings::default(),
            persistence,
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct EngineState {
    store: MessageStore,
    ledger: HiddenLedger,
    generation: u64,
}

#[derive(Default)]
struct PersistState {
    written_generation: u64,
    failing: bool,
}

struct EngineCore {
    identity: Identity,
    settings: EngineSettings,
    state: RwLock<EngineState>,
    persistence: Arc<dyn SnapshotStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    persist: Mutex<PersistState>,
    /// Last activity while the hidden section is unlocked.
    hidden_access: Mutex<Option<DateTime<Utc>>>,
}

pub struct Engine {
    core: Arc<EngineCore>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl Engine {
    /// Load persisted state and build the engine. The sweeper is not
    /// started; see [`Engine::start_sweeper`].
    pub fn open(config: EngineConfig) -> Result<Self, SettingsError> {
        config.settings.validate()?;
        let loaded = load_state(config.persistence.as_ref());
        info!(
            chats = loaded.store.chats().len(),
            hidden = loaded.ledger.len(),
            "engine state loaded"
        );
        let core = EngineCore {
            identity: config.identity,
            settings: config.settings,
            state: RwLock::new(EngineState {
                store: loaded.store,
                ledger: loaded.ledger,
                generation: 0,
            }),
            persistence: config.persistence,
            events: config.events,
            clock: config.clock,
            persist: Mutex::new(PersistState::default()),
            hidden_access: Mutex::new(None),
        };
        let core = Arc::new(core);
        if loaded.reconciled > 0 {
            let snapshot = core.capture(&mut core.state.write());
            core.persist(snapshot);
        }
        Ok(Self {
            core,
            sweeper: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.core.identity
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.core.settings
    }

    /// Seed a chat. Returns false if the id is already registered.
    pub fn register_chat(&self, chat: Chat) -> bool {
        self.core.register_chat(chat)
    }

    /// Send `text` from the session identity to the chat's participant.
    pub fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        hide_after: Option<Duration>,
    ) -> Result<String> {
        self.core.send_message(chat_id, text, hide_after)
    }

    /// Import a pre-existing message into a registered chat. A message
    /// that is already hidden gets its ledger entry straight away. Returns
    /// false if the id is known.
    pub fn seed_message(&self, message: Message) -> Result<bool> {
        let snapshot = {
            let mut state = self.core.state.write();
            if !state.store.insert_message(message.clone())? {
                return Ok(false);
            }
            if message.is_hidden() {
                let hidden_at = message.hide_at.unwrap_or(message.created_at);
                state.ledger.append(message, hidden_at);
            }
            self.core.capture(&mut state)
        };
        self.core.persist(snapshot);
        Ok(true)
    }

    /// Messages of a chat as `viewer_id` may see them: senders see all of
    /// their own, everyone else only visible ones.
    pub fn messages_for_chat(&self, chat_id: &str, viewer_id: &str) -> Vec<Message> {
        let state = self.core.state.read();
        state
            .store
            .messages_for_chat(chat_id)
            .into_iter()
            .filter(|m| m.is_visible_to(viewer_id))
            .collect()
    }

    pub fn list_chats(&self, search: Option<&str>) -> Vec<Chat> {
        let state = self.core.state.read();
        chat_index::list_chats(&state.store, search)
    }

    /// Returns true and unlocks the hidden section iff `attempt` matches the
    /// identity's secondary credential. A miss relocks it.
    pub fn verify_hidden_access(&self, attempt: &str) -> bool {
        self.core.verify_hidden_access(attempt)
    }

    pub fn lock_hidden_section(&self) {
        *self.core.hidden_access.lock() = None;
    }

    pub fn is_hidden_unlocked(&self) -> bool {
        self.core.hidden_access_valid(false)
    }

    /// The viewer's own hidden messages, grouped by receiver.
    pub fn list_hidden_messages(&self, viewer_id: &str) -> Result<Vec<HiddenConversation>> {
        if viewer_id != self.core.identity.id || !self.core.hidden_access_valid(true) {
            return Err(EngineError::HiddenSectionLocked);
        }
        let state = self.core.state.read();
        Ok(state
            .ledger
            .sent_by(viewer_id)
            .into_iter()
            .map(|(receiver, entries)| HiddenConversation {
                receiver_id: receiver.to_string(),
                participant_name: chat_index::participant_name(&state.store, receiver),
                entries: entries.into_iter().cloned().collect(),
            })
            .collect())
    }

    /// Run one sweep inline. Returns the number of messages hidden.
    pub fn sweep_now(&self) -> usize {
        self.core.sweep()
    }

    /// Retry persisting the current state if the last write failed.
    pub fn flush(&self) -> bool {
        self.core.flush()
    }

    pub fn persistence_pending(&self) -> bool {
        self.core.persist.lock().failing
    }

    /// Start the periodic sweeper on the current tokio runtime. Returns
    /// false if it is already running.
    pub fn start_sweeper(&self) -> bool {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return false;
        }
        let core = self.core.clone();
        let interval = self.core.settings.sweep_interval();
        *slot = Some(spawn_sweeper(interval, move || core.sweep()));
        self.core.events.record(
            "SWEEPER_STARTED",
            EventSeverity::Info,
            serde_json::json!({"interval_ms": interval.as_millis() as u64}),
        );
        true
    }

    pub fn wake_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().as_ref() {
            handle.wake();
        }
    }

    /// Stop the sweeper and flush pending writes. Safe to call more than
    /// once; only the first call stops anything.
    pub async fn shutdown(&self) {
        let handle = self.sweeper.lock().take();
        if let Some(mut handle) = handle {
            if handle.shutdown().await {
                self.core
                    .events
                    .record("SWEEPER_STOPPED", EventSeverity::Info, serde_json::json!({}));
            }
        }
        self.core.flush();
    }
}

impl EngineCore {
    fn register_chat(&self, chat: Chat) -> bool {
        let chat_id = chat.id.clone();
        let snapshot = {
            let mut state = self.state.write();
            if !state.store.register_chat(chat) {
                return false;
            }
            self.capture(&mut state)
        };
        info!(chat_id = %chat_id, "chat registered");
        self.persist(snapshot);
        true
    }

    fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        hide_after: Option<Duration>,
    ) -> Result<String> {
        if let Some(delay) = hide_after {
            let max = self.settings.max_hide_after();
            if delay > max {
                return Err(EngineError::HideDelayTooLong {
                    requested_secs: delay.as_secs(),
                    max_secs: max.as_secs(),
                });
            }
        }
        let now = self.clock.now();
        let (message, snapshot) = {
            let mut state = self.state.write();
            let receiver_id = state
                .store
                .chat(chat_id)
                .map(|c| c.participant_id.clone())
                .ok_or_else(|| EngineError::UnknownChat(chat_id.to_string()))?;
            let message = state.store.send_message(
                chat_id,
                &self.identity.id,
                &receiver_id,
                text,
                hide_after,
                now,
            )?;
            let snapshot = self.capture(&mut state);
            (message, snapshot)
        };
        info!(
            chat_id = %chat_id,
            message_id = %message.id,
            timed = message.hide_at.is_some(),
            "message sent"
        );
        self.events.record(
            "MESSAGE_SENT",
            EventSeverity::Info,
            serde_json::json!({
                "chat_id": chat_id,
                "message_id": message.id,
                "hide_at": message.hide_at,
            }),
        );
        self.persist(snapshot);
        Ok(message.id)
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let (hidden_ids, snapshot) = {
            let mut state = self.state.write();
            let due = state.store.transition_due(now);
            if due.is_empty() {
                return 0;
            }
            let mut ids = Vec::with_capacity(due.len());
            for message in due {
                ids.push(message.id.clone());
                if !state.ledger.append(message, now) {
                    warn!("hidden message already had a ledger entry");
                }
            }
            let snapshot = self.capture(&mut state);
            (ids, snapshot)
        };
        info!(count = hidden_ids.len(), "messages hidden");
        self.events.record(
            "MESSAGES_HIDDEN",
            EventSeverity::Info,
            serde_json::json!({"count": hidden_ids.len(), "message_ids": hidden_ids}),
        );
        self.persist(snapshot);
        hidden_ids.len()
    }

    fn verify_hidden_access(&self, attempt: &str) -> bool {
        let granted = verify_secondary(&self.identity, attempt);
        let mut access = self.hidden_access.lock();
        if granted {
            *access = Some(self.clock.now());
            self.events.record(
                "HIDDEN_ACCESS_GRANTED",
                EventSeverity::Info,
                serde_json::json!({"identity": self.identity.id}),
            );
        } else {
            *access = None;
            self.events.record(
                "HIDDEN_ACCESS_DENIED",
                EventSeverity::Warn,
                serde_json::json!({"identity": self.identity.id}),
            );
        }
        granted
    }

    /// Whether the hidden section is still unlocked; relocks on inactivity.
    fn hidden_access_valid(&self, touch: bool) -> bool {
        let now = self.clock.now();
        let mut access = self.hidden_access.lock();
        let Some(last) = *access else {
            return false;
        };
        let within = match self.settings.hidden_auto_lock() {
            Some(ttl) => (now - last).to_std().map_or(true, |elapsed| elapsed <= ttl),
            None => true,
        };
        if !within {
            *access = None;
            info!("hidden section auto-locked after inactivity");
            return false;
        }
        if touch {
            *access = Some(now);
        }
        true
    }

    fn capture(&self, state: &mut EngineState) -> Result<Snapshot, PersistenceError> {
        state.generation += 1;
        Snapshot::capture(state.generation, &state.store, &state.ledger)
    }

    /// Write a captured snapshot. Any failure, including one while
    /// capturing, leaves the engine pending until a later write lands.
    fn persist(&self, snapshot: Result<Snapshot, PersistenceError>) {
        let mut persist = self.persist.lock();
        let written = match snapshot {
            // A newer snapshot already landed.
            Ok(snapshot) if snapshot.generation <= persist.written_generation => return,
            Ok(snapshot) => snapshot
                .write_to(self.persistence.as_ref())
                .map(|()| snapshot.generation),
            Err(err) => Err(err),
        };
        match written {
            Ok(generation) => {
                persist.written_generation = generation;
                if persist.failing {
                    persist.failing = false;
                    info!("persistence recovered");
                    self.events.record(
                        "PERSISTENCE_RECOVERED",
                        EventSeverity::Info,
                        serde_json::json!({"generation": generation}),
                    );
                }
            }
            Err(err) => {
                persist.failing = true;
                drop(persist);
                self.report_persistence_failure(&err.to_string());
            }
        }
    }

    fn report_persistence_failure(&self, reason: &str) {
        error!(error = %reason, "persisting engine state failed; keeping in-memory state");
        self.events.record(
            "PERSISTENCE_FAILURE",
            EventSeverity::Error,
            serde_json::json!({"error": reason}),
        );
    }

    fn flush(&self) -> bool {
        if !self.persist.lock().failing {
            return true;
        }
        let snapshot = self.capture(&mut self.state.write());
        self.persist(snapshot);
        !self.persist.lock().failing
    }
}
