use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("transport failure fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream returned HTTP {status} for {url}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{source_id} payload could not be parsed: {message}")]
    Parse { source_id: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WatchError {
    /// Short classification used for run error details and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            WatchError::Transport { .. } => "transport",
            WatchError::Status { .. } => "status",
            WatchError::Body { .. } => "body",
            WatchError::Parse { .. } => "parse",
            WatchError::Storage(_) | WatchError::Sqlite(_) => "storage",
            WatchError::Json(_) => "json",
            WatchError::Toml(_) | WatchError::Config(_) => "config",
            WatchError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
