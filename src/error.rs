//! Error types for the mail gateway.

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MIME error: {0}")]
    Mime(#[from] MimeError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while rebuilding or reading a fetched MIME body.
#[derive(Debug, thiserror::Error)]
pub enum MimeError {
    #[error("Multipart body declares no boundary")]
    MissingBoundary,

    #[error("Unparseable MIME document: {reason}")]
    Unparseable { reason: String },

    #[error("Unreadable MIME part {index}: {reason}")]
    UnreadablePart { index: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox listener and outbound sender errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Protocol error on channel {name}: {reason}")]
    Protocol { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// User store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read user file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed user file {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure raised by a message handler.
///
/// `Normal` faults carry a message meant for the sender and are shown
/// verbatim in the reply. Everything else is reported as a generic
/// server error while the detail goes to the log.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error("{0}")]
    Normal(String),

    #[error("program error: {0}")]
    Program(String),

    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

/// User-facing text for internal faults.
pub const SERVER_ERROR_MESSAGE: &str = "server error";

impl Fault {
    pub fn normal(message: impl Into<String>) -> Self {
        Self::Normal(message.into())
    }

    pub fn program(message: impl Into<String>) -> Self {
        Self::Program(message.into())
    }

    /// Text shown to the sender in the error reply.
    pub fn user_message(&self) -> String {
        match self {
            Self::Normal(msg) => msg.clone(),
            Self::Program(_) | Self::Unclassified(_) => SERVER_ERROR_MESSAGE.to_string(),
        }
    }

    /// Detail written to the log. Empty for normal faults.
    pub fn log_message(&self) -> String {
        match self {
            Self::Normal(_) => String::new(),
            Self::Program(msg) => msg.clone(),
            Self::Unclassified(err) => format!("{err:#}"),
        }
    }
}

/// Failures that end a single request task without a reply.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Failed to read mail body: {0}")]
    Mime(#[from] MimeError),

    #[error("Request task panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;
