use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use sealmsg_core::{
    Chat, Document, EngineError, EngineSettings, EventSeverity, EventSink, FileSnapshotStore,
    Identity, ManualClock, MemorySnapshotStore, Message, SecondaryCredential, SnapshotStore,
    Visibility,
};
use sealmsg_service::{Engine, EngineConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ME: &str = "me";

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(String, EventSeverity)>>,
}

impl RecordingSink {
    fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == event_type)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event_type: &str, severity: EventSeverity, _data: serde_json::Value) {
        self.events.lock().push((event_type.to_string(), severity));
    }
}

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    store: Arc<MemorySnapshotStore>,
    events: Arc<RecordingSink>,
}

fn identity() -> Identity {
    Identity {
        id: ME.into(),
        display_name: "Me".into(),
        secondary_credential: SecondaryCredential::plain("Hunter2"),
    }
}

fn start() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn open_with(
    store: Arc<MemorySnapshotStore>,
    clock: Arc<ManualClock>,
    settings: EngineSettings,
) -> Harness {
    let events = Arc::new(RecordingSink::default());
    let config = EngineConfig::new(identity(), store.clone())
        .with_settings(settings)
        .with_clock(clock.clone())
        .with_events(events.clone());
    let engine = Engine::open(config).unwrap();
    Harness {
        engine,
        clock,
        store,
        events,
    }
}

fn harness() -> Harness {
    let h = open_with(
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(ManualClock::new(start())),
        EngineSettings::default(),
    );
    h.engine.register_chat(Chat::new("chat1", "user1", "Alice"));
    h.engine.register_chat(Chat::new("chat2", "user2", "Bob"));
    h
}

fn advance_ms(clock: &ManualClock, ms: i64) {
    clock.advance(ChronoDuration::milliseconds(ms));
}

#[test]
fn timed_message_hides_exactly_at_deadline() {
    let h = harness();
    let id = h
        .engine
        .send_message("chat1", "see you soon", Some(Duration::from_secs(1)))
        .unwrap();

    assert_eq!(h.engine.sweep_now(), 0);
    assert_eq!(h.engine.messages_for_chat("chat1", "user1").len(), 1);

    advance_ms(&h.clock, 500);
    assert_eq!(h.engine.sweep_now(), 0);
    assert_eq!(h.engine.messages_for_chat("chat1", "user1").len(), 1);

    advance_ms(&h.clock, 500);
    assert_eq!(h.engine.sweep_now(), 1);
    assert!(h.engine.messages_for_chat("chat1", "user1").is_empty());

    let own = h.engine.messages_for_chat("chat1", ME);
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].id, id);
    assert_eq!(own[0].visibility, Visibility::Hidden);

    assert!(h.engine.verify_hidden_access("Hunter2"));
    let hidden = h.engine.list_hidden_messages(ME).unwrap();
    assert_eq!(hidden.len(), 1);
    assert_eq!(hidden[0].receiver_id, "user1");
    assert_eq!(hidden[0].participant_name.as_deref(), Some("Alice"));
    assert_eq!(hidden[0].entries.len(), 1);
    assert_eq!(hidden[0].entries[0].message.id, id);
    assert_eq!(hidden[0].entries[0].hidden_at, start() + ChronoDuration::seconds(1));
    assert_eq!(h.events.count("MESSAGES_HIDDEN"), 1);
}

#[test]
fn untimed_and_zero_delay_messages_never_hide() {
    let h = harness();
    h.engine.send_message("chat1", "forever", None).unwrap();
    h.engine
        .send_message("chat1", "also forever", Some(Duration::ZERO))
        .unwrap();

    for _ in 0..50 {
        advance_ms(&h.clock, 60_000);
        assert_eq!(h.engine.sweep_now(), 0);
    }
    let seen = h.engine.messages_for_chat("chat1", "user1");
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|m| m.hide_at.is_none()));
}

#[test]
fn repeated_sweeps_record_each_message_once() {
    let h = harness();
    h.engine
        .send_message("chat1", "one", Some(Duration::from_secs(2)))
        .unwrap();
    h.engine
        .send_message("chat2", "two", Some(Duration::from_secs(2)))
        .unwrap();
    advance_ms(&h.clock, 5_000);

    assert_eq!(h.engine.sweep_now(), 2);
    for _ in 0..10 {
        assert_eq!(h.engine.sweep_now(), 0);
    }

    assert!(h.engine.verify_hidden_access("Hunter2"));
    let hidden = h.engine.list_hidden_messages(ME).unwrap();
    let total: usize = hidden.iter().map(|c| c.entries.len()).sum();
    assert_eq!(total, 2);
    assert_eq!(h.events.count("MESSAGES_HIDDEN"), 1);
}

#[test]
fn messages_keep_insertion_order_and_update_preview() {
    let h = harness();
    for text in ["first", "second", "third"] {
        h.engine.send_message("chat2", text, None).unwrap();
    }
    let texts: Vec<_> = h
        .engine
        .messages_for_chat("chat2", "user2")
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, ["first", "second", "third"]);

    let chats = h.engine.list_chats(Some("bob"));
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].last_message_text, "third");
}

#[test]
fn send_rejects_bad_input() {
    let h = harness();
    assert!(matches!(
        h.engine.send_message("nope", "hi", None),
        Err(EngineError::UnknownChat(id)) if id == "nope"
    ));
    assert!(matches!(
        h.engine.send_message("chat1", "   ", None),
        Err(EngineError::EmptyText)
    ));
    assert!(matches!(
        h.engine
            .send_message("chat1", "too long", Some(Duration::from_secs(86_401))),
        Err(EngineError::HideDelayTooLong { max_secs: 86_400, .. })
    ));
    assert!(h.engine.messages_for_chat("chat1", ME).is_empty());
    assert!(h.engine.messages_for_chat("missing", ME).is_empty());
}

#[test]
fn oversized_delay_is_an_error_not_a_crash() {
    let settings = EngineSettings {
        max_hide_after_secs: sealmsg_core::settings::HIDE_AFTER_CEILING_SECS,
        ..EngineSettings::default()
    };
    let h = open_with(
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(ManualClock::new(start())),
        settings,
    );
    h.engine.register_chat(Chat::new("chat1", "user1", "Alice"));
    for delay in [Duration::from_secs(10_000_000_000_000), Duration::MAX] {
        assert!(matches!(
            h.engine.send_message("chat1", "hi", Some(delay)),
            Err(EngineError::HideDelayTooLong { .. })
        ));
    }
    assert!(h.engine.messages_for_chat("chat1", ME).is_empty());
}

#[test]
fn concurrent_sends_and_sweeps_hide_each_message_once() {
    const SENDERS: usize = 4;
    const PER_SENDER: usize = 50;
    let h = harness();
    let stop = AtomicBool::new(false);

    let (sent, swept) = std::thread::scope(|scope| {
        let sweeper = scope.spawn(|| {
            let mut hidden = 0;
            while !stop.load(Ordering::SeqCst) {
                advance_ms(&h.clock, 1);
                hidden += h.engine.sweep_now();
            }
            hidden
        });
        let senders: Vec<_> = (0..SENDERS)
            .map(|i| {
                let engine = &h.engine;
                scope.spawn(move || {
                    let chat = if i % 2 == 0 { "chat1" } else { "chat2" };
                    (0..PER_SENDER)
                        .map(|n| {
                            engine
                                .send_message(
                                    chat,
                                    &format!("{i}-{n}"),
                                    Some(Duration::from_millis(1)),
                                )
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let sent: Vec<String> = senders
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        stop.store(true, Ordering::SeqCst);
        (sent, sweeper.join().unwrap())
    });

    advance_ms(&h.clock, 1);
    let total = SENDERS * PER_SENDER;
    assert_eq!(swept + h.engine.sweep_now(), total);
    assert_eq!(h.engine.sweep_now(), 0);

    let sent_ids: HashSet<_> = sent.iter().cloned().collect();
    assert_eq!(sent_ids.len(), total);
    for chat in ["chat1", "chat2"] {
        assert!(h.engine.messages_for_chat(chat, "user1").is_empty());
        assert!(h.engine.messages_for_chat(chat, ME).iter().all(|m| m.is_hidden()));
    }

    assert!(h.engine.verify_hidden_access("Hunter2"));
    let hidden = h.engine.list_hidden_messages(ME).unwrap();
    let ledger_ids: Vec<_> = hidden
        .iter()
        .flat_map(|c| c.entries.iter().map(|e| e.message.id.clone()))
        .collect();
    assert_eq!(ledger_ids.len(), total);
    assert_eq!(ledger_ids.into_iter().collect::<HashSet<_>>(), sent_ids);

    // The last snapshot written matches the live state.
    assert!(!h.engine.persistence_pending());
    let reopened = open_with(
        h.store.clone(),
        Arc::new(ManualClock::new(h.clock_now())),
        EngineSettings::default(),
    );
    for chat in ["chat1", "chat2"] {
        assert_eq!(
            reopened.engine.messages_for_chat(chat, ME),
            h.engine.messages_for_chat(chat, ME)
        );
    }
    assert!(reopened.engine.verify_hidden_access("Hunter2"));
    assert_eq!(reopened.engine.list_hidden_messages(ME).unwrap(), hidden);
}

#[test]
fn seeded_history_keeps_preview_and_ledger() {
    let h = harness();
    let base = Message {
        id: "m1".into(),
        chat_id: "chat1".into(),
        text: "Hey, how are you?".into(),
        sender_id: "user1".into(),
        receiver_id: ME.into(),
        created_at: start() - ChronoDuration::hours(1),
        hide_at: None,
        visibility: Visibility::Visible,
    };
    let secret = Message {
        id: "m3".into(),
        text: "gone already".into(),
        hide_at: Some(start() - ChronoDuration::minutes(10)),
        visibility: Visibility::Hidden,
        ..base.clone()
    };
    let mine = Message {
        id: "m4".into(),
        sender_id: ME.into(),
        receiver_id: "user1".into(),
        hide_at: Some(start() - ChronoDuration::minutes(5)),
        visibility: Visibility::Hidden,
        ..base.clone()
    };

    assert!(h.engine.seed_message(base.clone()).unwrap());
    assert!(h.engine.seed_message(secret.clone()).unwrap());
    assert!(h.engine.seed_message(mine).unwrap());
    assert!(!h.engine.seed_message(base.clone()).unwrap());
    assert!(matches!(
        h.engine.seed_message(Message {
            id: "m9".into(),
            chat_id: "nope".into(),
            ..base
        }),
        Err(EngineError::UnknownChat(_))
    ));

    // Incoming hidden message is gone for the receiver, kept for its sender.
    let seen: Vec<_> = h
        .engine
        .messages_for_chat("chat1", ME)
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(seen, ["m1", "m4"]);
    let theirs: Vec<_> = h
        .engine
        .messages_for_chat("chat1", "user1")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(theirs, ["m1", "m3"]);
    assert_eq!(h.engine.list_chats(Some("alice"))[0].last_message_text, "");

    // Already hidden, so nothing left for a sweep.
    assert_eq!(h.engine.sweep_now(), 0);
    assert!(h.engine.verify_hidden_access("Hunter2"));
    let hidden = h.engine.list_hidden_messages(ME).unwrap();
    assert_eq!(hidden.len(), 1);
    assert_eq!(hidden[0].entries[0].message.id, "m4");
    assert_eq!(hidden[0].entries[0].hidden_at, start() - ChronoDuration::minutes(5));

    let reopened = open_with(
        h.store.clone(),
        Arc::new(ManualClock::new(start())),
        EngineSettings::default(),
    );
    assert_eq!(reopened.engine.messages_for_chat("chat1", "user1").len(), 2);
    assert!(reopened.engine.verify_hidden_access("Hunter2"));
    assert_eq!(reopened.engine.list_hidden_messages(ME).unwrap(), hidden);
}

#[test]
fn chat_search_is_case_insensitive_substring() {
    let h = harness();
    h.engine.register_chat(Chat::new("chat3", "user3", "Charlie"));
    assert!(!h.engine.register_chat(Chat::new("chat3", "user3", "Charlie")));

    let names = |q: Option<&str>| -> Vec<String> {
        h.engine
            .list_chats(q)
            .into_iter()
            .map(|c| c.participant_name)
            .collect()
    };
    assert_eq!(names(None), ["Alice", "Bob", "Charlie"]);
    assert_eq!(names(Some("")), ["Alice", "Bob", "Charlie"]);
    assert_eq!(names(Some("AL")), ["Alice"]);
    assert_eq!(names(Some("li")), ["Alice", "Charlie"]);
    assert!(names(Some("zed")).is_empty());
}

#[test]
fn hidden_section_requires_exact_credential() {
    let h = harness();
    assert!(matches!(
        h.engine.list_hidden_messages(ME),
        Err(EngineError::HiddenSectionLocked)
    ));
    assert!(!h.engine.verify_hidden_access("hunter2"));
    assert!(!h.engine.verify_hidden_access("Hunter2 "));
    assert!(!h.engine.verify_hidden_access(""));
    assert!(!h.engine.is_hidden_unlocked());

    assert!(h.engine.verify_hidden_access("Hunter2"));
    assert!(h.engine.is_hidden_unlocked());
    assert!(h.engine.list_hidden_messages(ME).unwrap().is_empty());

    // Another viewer never gets the session's hidden section.
    assert!(matches!(
        h.engine.list_hidden_messages("user1"),
        Err(EngineError::HiddenSectionLocked)
    ));

    // A failed attempt relocks.
    assert!(!h.engine.verify_hidden_access("wrong"));
    assert!(!h.engine.is_hidden_unlocked());
    assert_eq!(h.events.count("HIDDEN_ACCESS_GRANTED"), 1);
    assert_eq!(h.events.count("HIDDEN_ACCESS_DENIED"), 4);
}

#[test]
fn hidden_section_auto_locks_after_inactivity() {
    let h = harness();
    assert!(h.engine.verify_hidden_access("Hunter2"));

    advance_ms(&h.clock, 200_000);
    assert!(h.engine.list_hidden_messages(ME).is_ok());
    // Access refreshed the session.
    advance_ms(&h.clock, 200_000);
    assert!(h.engine.list_hidden_messages(ME).is_ok());

    advance_ms(&h.clock, 301_000);
    assert!(matches!(
        h.engine.list_hidden_messages(ME),
        Err(EngineError::HiddenSectionLocked)
    ));

    assert!(h.engine.verify_hidden_access("Hunter2"));
    h.engine.lock_hidden_section();
    assert!(!h.engine.is_hidden_unlocked());
}

#[test]
fn argon2_credential_verifies() {
    let store = Arc::new(MemorySnapshotStore::new());
    let config = EngineConfig::new(
        Identity {
            id: ME.into(),
            display_name: "Me".into(),
            secondary_credential: SecondaryCredential::hashed_with_params("s3cret", 1024, 1, 1)
                .unwrap(),
        },
        store,
    );
    let engine = Engine::open(config).unwrap();
    assert!(!engine.verify_hidden_access("S3cret"));
    assert!(engine.verify_hidden_access("s3cret"));
}

#[test]
fn persistence_failure_keeps_state_and_recovers() {
    let h = harness();
    h.store.fail_writes(true);
    let id = h
        .engine
        .send_message("chat1", "while offline", Some(Duration::from_secs(1)))
        .unwrap();
    assert!(h.engine.persistence_pending());
    assert_eq!(h.events.count("PERSISTENCE_FAILURE"), 1);
    assert_eq!(h.engine.messages_for_chat("chat1", "user1")[0].id, id);

    advance_ms(&h.clock, 1_000);
    assert_eq!(h.engine.sweep_now(), 1);
    assert!(!h.engine.flush());

    h.store.fail_writes(false);
    assert!(h.engine.flush());
    assert!(!h.engine.persistence_pending());
    assert_eq!(h.events.count("PERSISTENCE_RECOVERED"), 1);

    let reopened = open_with(
        h.store.clone(),
        Arc::new(ManualClock::new(h.clock_now())),
        EngineSettings::default(),
    );
    let own = reopened.engine.messages_for_chat("chat1", ME);
    assert_eq!(own.len(), 1);
    assert!(own[0].is_hidden());
}

#[test]
fn next_mutation_retries_failed_write() {
    let h = harness();
    h.store.fail_document(Document::HiddenLedger);
    h.engine.send_message("chat1", "a", None).unwrap();
    assert!(h.engine.persistence_pending());

    h.store.fail_writes(false);
    let saves = h.store.save_count();
    h.engine.send_message("chat1", "b", None).unwrap();
    assert!(!h.engine.persistence_pending());
    assert_eq!(h.store.save_count(), saves + 3);
    let messages = String::from_utf8(h.store.raw(Document::MessagesByChat).unwrap()).unwrap();
    assert!(messages.contains("\"a\"") && messages.contains("\"b\""));
}

#[test]
fn restart_restores_chats_messages_and_ledger() {
    let h = harness();
    h.engine
        .send_message("chat1", "gone soon", Some(Duration::from_secs(3)))
        .unwrap();
    h.engine.send_message("chat2", "stays", None).unwrap();
    h.engine
        .send_message("chat2", "pending", Some(Duration::from_secs(60)))
        .unwrap();
    advance_ms(&h.clock, 3_000);
    assert_eq!(h.engine.sweep_now(), 1);
    let now = h.clock_now();
    drop(h.engine);

    let reopened = open_with(
        h.store.clone(),
        Arc::new(ManualClock::new(now)),
        EngineSettings::default(),
    );
    let engine = &reopened.engine;
    assert_eq!(engine.list_chats(None).len(), 2);
    assert!(engine.messages_for_chat("chat1", "user1").is_empty());
    assert_eq!(engine.messages_for_chat("chat2", "user2").len(), 2);
    assert_eq!(engine.list_chats(Some("bob"))[0].last_message_text, "pending");

    assert!(engine.verify_hidden_access("Hunter2"));
    assert_eq!(engine.list_hidden_messages(ME).unwrap()[0].entries.len(), 1);

    // The surviving timer still fires after restart.
    advance_ms(&reopened.clock, 60_000);
    assert_eq!(engine.sweep_now(), 1);
    assert_eq!(engine.messages_for_chat("chat2", "user2").len(), 1);
}

#[test]
fn malformed_documents_load_as_empty() {
    let store = Arc::new(MemorySnapshotStore::new());
    store.put_raw(Document::Chats, b"{not json");
    store.put_raw(Document::HiddenLedger, b"[1, 2");
    let h = open_with(
        store,
        Arc::new(ManualClock::new(start())),
        EngineSettings::default(),
    );
    assert!(h.engine.list_chats(None).is_empty());
    assert!(h.engine.verify_hidden_access("Hunter2"));
    assert!(h.engine.list_hidden_messages(ME).unwrap().is_empty());
}

#[test]
fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(start()));
    let open = |clock: Arc<ManualClock>| {
        let store: Arc<dyn SnapshotStore> =
            Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        Engine::open(EngineConfig::new(identity(), store).with_clock(clock)).unwrap()
    };

    let engine = open(clock.clone());
    engine.register_chat(Chat::new("chat1", "user1", "Alice"));
    engine
        .send_message("chat1", "on disk", Some(Duration::from_secs(1)))
        .unwrap();
    drop(engine);

    advance_ms(&clock, 1_000);
    let engine = open(clock.clone());
    assert_eq!(engine.sweep_now(), 1);
    drop(engine);

    let engine = open(clock);
    assert!(engine.messages_for_chat("chat1", "user1").is_empty());
    assert!(engine.verify_hidden_access("Hunter2"));
    let hidden = engine.list_hidden_messages(ME).unwrap();
    assert_eq!(hidden[0].entries[0].message.text, "on disk");
}

#[test]
fn invalid_settings_are_rejected() {
    let bad = [
        EngineSettings {
            sweep_interval_ms: 0,
            ..EngineSettings::default()
        },
        EngineSettings {
            max_hide_after_secs: u64::MAX,
            ..EngineSettings::default()
        },
    ];
    for settings in bad {
        let config = EngineConfig::new(identity(), Arc::new(MemorySnapshotStore::new()))
            .with_settings(settings);
        assert!(Engine::open(config).is_err());
    }
}

#[tokio::test]
async fn background_sweeper_hides_due_messages_and_stops() {
    let settings = EngineSettings {
        sweep_interval_ms: 10,
        ..EngineSettings::default()
    };
    let h = open_with(
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(ManualClock::new(start())),
        settings,
    );
    h.engine.register_chat(Chat::new("chat1", "user1", "Alice"));
    h.engine
        .send_message("chat1", "tick", Some(Duration::from_secs(1)))
        .unwrap();

    assert!(h.engine.start_sweeper());
    assert!(!h.engine.start_sweeper());
    advance_ms(&h.clock, 1_000);
    h.engine.wake_sweeper();

    let mut hidden = false;
    for _ in 0..100 {
        if h.engine.messages_for_chat("chat1", "user1").is_empty() {
            hidden = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hidden);

    h.engine.shutdown().await;
    h.engine.shutdown().await;
    assert_eq!(h.events.count("SWEEPER_STARTED"), 1);
    assert_eq!(h.events.count("SWEEPER_STOPPED"), 1);

    // Nothing sweeps after shutdown.
    h.engine
        .send_message("chat1", "late", Some(Duration::from_secs(1)))
        .unwrap();
    advance_ms(&h.clock, 1_000);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.messages_for_chat("chat1", "user1").len(), 1);
    assert_eq!(h.events.count("MESSAGES_HIDDEN"), 1);
}

impl Harness {
    fn clock_now(&self) -> chrono::DateTime<Utc> {
        use sealmsg_core::Clock;
        self.clock.now()
    }
}
