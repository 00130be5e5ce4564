#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No response was received (DNS, refused connection, timeout, TLS).
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered with a non-2xx status, or a 2xx response
    /// lacked fields the operation requires.
    #[error("{message}")]
    Request { status: u16, message: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Configuration error: {0}")]
    Config(String),
    /// Federated login callback carried an error or was incomplete.
    #[error("OAuth error: {0}")]
    OAuth(String),
    #[error("OAuth state mismatch")]
    StateMismatch,
    /// A newer session operation was issued while this one was in flight.
    #[error("Superseded by a newer session operation")]
    Superseded,
}

impl Error {
    /// HTTP status of a [`Error::Request`], if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Token persistence failures. Never escapes [`ApiClient`](crate::ApiClient).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("Token store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Token store format error: {0}")]
    Format(#[from] serde_json::Error),
}
