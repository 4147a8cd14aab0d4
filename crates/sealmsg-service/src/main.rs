use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use clap::{Parser, Subcommand};
use sealmsg_core::paths::{data_dir, identity_path, log_dir, state_dir};
use sealmsg_core::settings::{format_hide_timer, load_settings};
use sealmsg_core::{
    Chat, EventLog, FileSnapshotStore, Identity, Message, SecondaryCredential, Visibility,
};
use sealmsg_service::{Engine, EngineConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SealMsg ephemeral messaging engine", long_about = None)]
struct Cli {
    /// Override the data directory (also SEALMSG_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the session identity and seed the demo chats and history
    Init {
        #[arg(long)]
        name: String,
    },
    /// Show recent engine events and check the log's hash chain
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    #[command(flatten)]
    Engine(EngineCommand),
}

/// Commands that run against an opened engine.
#[derive(Subcommand, Debug)]
enum EngineCommand {
    /// List chats, optionally filtered by participant name
    Chats {
        #[arg(long)]
        search: Option<String>,
    },
    /// Send a message into a chat
    Send {
        chat: String,
        text: String,
        /// Hide the message after this many seconds
        #[arg(long)]
        hide_after: Option<u64>,
    },
    /// Show a chat's messages as a given viewer sees them
    Messages {
        chat: String,
        /// Viewer id; defaults to the session identity
        #[arg(long = "as")]
        viewer: Option<String>,
    },
    /// Open the hidden section (prompts for the hidden-section password)
    Hidden,
    /// Run the expiry sweeper until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let data = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&data)?;

    match cli.command {
        Commands::Init { name } => init_command(&data, &name),
        Commands::Events { limit } => events_command(&data, limit, cli.json),
        Commands::Engine(command) => engine_command(&data, command, cli.json).await,
    }
}

async fn engine_command(data: &Path, command: EngineCommand, json: bool) -> Result<()> {
    let engine = open_engine(data)?;
    // Timers that elapsed while nothing was running take effect first.
    engine.sweep_now();
    let outcome = match command {
        EngineCommand::Chats { search } => chats_command(&engine, search.as_deref(), json),
        EngineCommand::Send {
            chat,
            text,
            hide_after,
        } => send_command(&engine, &chat, &text, hide_after.map(Duration::from_secs)),
        EngineCommand::Messages { chat, viewer } => {
            let viewer = viewer.unwrap_or_else(|| engine.identity().id.clone());
            messages_command(&engine, &chat, &viewer, json)
        }
        EngineCommand::Hidden => hidden_command(&engine, json),
        EngineCommand::Run => run_command(&engine).await,
    };
    engine.shutdown().await;
    if engine.persistence_pending() {
        eprintln!("warning: state could not be saved; see the event log");
    }
    outcome
}

fn init_command(data: &Path, name: &str) -> Result<()> {
    let path = identity_path(data);
    if path.exists() {
        return Err(anyhow!("identity already exists at {}", path.display()));
    }
    if name.trim().is_empty() {
        return Err(anyhow!("display name must not be empty"));
    }
    let password = prompt_password_twice("Create hidden-section password")?;
    let identity = Identity {
        id: uuid::Uuid::new_v4().to_string(),
        display_name: name.trim().to_string(),
        secondary_credential: SecondaryCredential::hashed(&password)?,
    };
    std::fs::write(&path, serde_json::to_vec_pretty(&identity)?)?;

    let engine = open_engine(data)?;
    let chats = demo_chats()
        .into_iter()
        .filter(|chat| engine.register_chat(chat.clone()))
        .count();
    let mut messages = 0;
    for message in demo_messages(&identity.id, Utc::now()) {
        if engine.seed_message(message)? {
            messages += 1;
        }
    }
    println!("Identity created: {} ({})", identity.display_name, identity.id);
    println!("Seeded {chats} chats and {messages} messages");
    Ok(())
}

fn open_engine(data: &Path) -> Result<Engine> {
    let identity: Identity = {
        let path = identity_path(data);
        let raw = std::fs::read(&path)
            .with_context(|| format!("no identity at {}; run init first", path.display()))?;
        serde_json::from_slice(&raw).context("parse identity")?
    };
    let settings = load_settings(data)?;
    let store = FileSnapshotStore::open(state_dir(data))?;
    let event_log = open_event_log(data, settings.event_log_max_bytes)?;
    let config = EngineConfig::new(identity, Arc::new(store))
        .with_settings(settings)
        .with_events(Arc::new(event_log));
    Ok(Engine::open(config)?)
}

fn open_event_log(data: &Path, max_bytes: u64) -> Result<EventLog> {
    EventLog::new(log_dir(data).join("events.log"), max_bytes)
}

fn events_command(data: &Path, limit: usize, json: bool) -> Result<()> {
    let settings = load_settings(data)?;
    let log = open_event_log(data, settings.event_log_max_bytes)?;
    let entries = log.read_recent(None, Some(limit))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in entries.iter().rev() {
            println!(
                "{:>6}  {}  {:?}  {}  {}",
                entry.seq,
                entry.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                entry.severity,
                entry.event_type,
                entry.data
            );
        }
    }
    let verified = log
        .verify_chain()
        .context("event log hash chain is broken")?;
    if !json {
        println!("Hash chain intact ({verified} entries in current file)");
    }
    Ok(())
}

fn chats_command(engine: &Engine, search: Option<&str>, json: bool) -> Result<()> {
    let chats = engine.list_chats(search);
    if json {
        println!("{}", serde_json::to_string_pretty(&chats)?);
        return Ok(());
    }
    if chats.is_empty() {
        println!("No chats found");
    }
    for chat in chats {
        println!("{:<12} {:<16} {}", chat.id, chat.participant_name, chat.last_message_text);
    }
    Ok(())
}

fn send_command(
    engine: &Engine,
    chat: &str,
    text: &str,
    hide_after: Option<Duration>,
) -> Result<()> {
    let id = engine.send_message(chat, text, hide_after)?;
    match hide_after.filter(|d| !d.is_zero()) {
        Some(delay) => println!("Sent {id} (disappears after {})", format_hide_timer(delay)),
        None => println!("Sent {id}"),
    }
    Ok(())
}

fn messages_command(engine: &Engine, chat: &str, viewer: &str, json: bool) -> Result<()> {
    let messages = engine.messages_for_chat(chat, viewer);
    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    for message in &messages {
        println!("{}", render_message(message, viewer));
    }
    Ok(())
}

fn render_message(message: &Message, viewer: &str) -> String {
    let who = if message.sender_id == viewer { "me" } else { message.sender_id.as_str() };
    let time = message.created_at.with_timezone(&Local).format("%-I:%M %p");
    let status = match message.hide_at {
        _ if message.is_hidden() => " [hidden]".to_string(),
        Some(at) => match (at - Utc::now()).to_std() {
            Ok(left) => format!(" [hides in {}]", format_hide_timer(left)),
            Err(_) => " [hiding]".to_string(),
        },
        None => String::new(),
    };
    format!("{time}  {who}: {}{status}", message.text)
}

fn hidden_command(engine: &Engine, json: bool) -> Result<()> {
    let attempt = prompt_password_once("Hidden-section password")?;
    if !engine.verify_hidden_access(&attempt) {
        return Err(anyhow!("incorrect password for hidden section"));
    }
    let groups = engine.list_hidden_messages(&engine.identity().id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }
    if groups.is_empty() {
        println!("No hidden messages");
    }
    for group in groups {
        println!("{}", group.participant_name.as_deref().unwrap_or("Unknown"));
        for entry in group.entries {
            println!(
                "  {}  (sent {}, disappeared {})",
                entry.message.text,
                entry.message.created_at.with_timezone(&Local).format("%b %-d, %Y %-I:%M %p"),
                entry.hidden_at.with_timezone(&Local).format("%b %-d, %Y %-I:%M %p"),
            );
        }
    }
    Ok(())
}

async fn run_command(engine: &Engine) -> Result<()> {
    engine.start_sweeper();
    info!("sweeper running; press Ctrl-C to stop");
    signal::ctrl_c().await?;
    info!("stopping");
    Ok(())
}

fn demo_chats() -> Vec<Chat> {
    [
        ("chat1", "user1", "Alice", "Hey, how are you?"),
        ("chat2", "user2", "Bob", "Can we meet tomorrow?"),
        ("chat3", "user3", "Charlie", "That sounds great!"),
    ]
    .into_iter()
    .map(|(id, participant, name, last)| Chat {
        last_message_text: last.to_string(),
        ..Chat::new(id, participant, name)
    })
    .collect()
}

/// Starter history for the demo chats, timed relative to `now`. One
/// incoming message has already disappeared.
fn demo_messages(me: &str, now: DateTime<Utc>) -> Vec<Message> {
    let at = |secs_ago: i64| now - ChronoDuration::seconds(secs_ago);
    let message = |chat: &str, from: &str, to: &str, text: &str, secs_ago: i64| Message {
        id: uuid::Uuid::new_v4().to_string(),
        chat_id: chat.to_string(),
        text: text.to_string(),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        created_at: at(secs_ago),
        hide_at: None,
        visibility: Visibility::Visible,
    };
    let secret = Message {
        hide_at: Some(at(1_000)),
        visibility: Visibility::Hidden,
        ..message(
            "chat1",
            "user1",
            me,
            "This is a secret message that will disappear",
            3_400,
        )
    };
    vec![
        message("chat1", "user1", me, "Hey, how are you?", 3_600),
        message("chat1", me, "user1", "I'm good, thanks! How about you?", 3_500),
        secret,
        message("chat2", "user2", me, "Can we meet tomorrow?", 86_400),
        message("chat2", me, "user2", "Sure, what time works for you?", 80_000),
    ]
}

fn prompt_password_once(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("SEALMSG_HIDDEN_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let pw = rpassword::prompt_password(format!("{prompt}: "))
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    if pw.is_empty() {
        return Err(anyhow!("password must not be empty"));
    }
    Ok(pw)
}

fn prompt_password_twice(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("SEALMSG_HIDDEN_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let first = prompt_password_once(prompt)?;
    let second = rpassword::prompt_password("Confirm password: ")
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
