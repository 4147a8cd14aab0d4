use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown chat: {0}")]
    UnknownChat(String),

    #[error("Message text is empty")]
    EmptyText,

    #[error("Hide delay of {requested_secs}s exceeds the {max_secs}s maximum")]
    HideDelayTooLong { requested_secs: u64, max_secs: u64 },

    #[error("Hidden section is locked; verify the secondary credential first")]
    HiddenSectionLocked,

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
