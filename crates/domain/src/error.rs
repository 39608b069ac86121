/// Shared error type used across all Foreman crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model: {0}")]
    Model(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("store: {0}")]
    Store(String),

    #[error("channel: {0}")]
    Channel(String),

    #[error("delegation: {0}")]
    Delegation(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// A short, user-presentable description with internals stripped.
    ///
    /// Channels only ever see this; the full error goes to logs.
    pub fn sanitized(&self) -> String {
        match self {
            Error::Model(_) => "the model provider returned an error".into(),
            Error::Tool { tool, .. } => format!("tool '{tool}' failed"),
            Error::Store(_) => "a storage operation failed".into(),
            Error::Channel(_) => "the channel rejected a delivery".into(),
            Error::Delegation(_) => "a delegated task failed".into(),
            Error::Config(_) => "the agent is misconfigured".into(),
            Error::Io(_) | Error::Json(_) | Error::Other(_) => {
                "an internal error occurred".into()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
