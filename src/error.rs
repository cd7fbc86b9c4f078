//! Error types for mailstream

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The TCP connection to the mail server could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The proxy refused the handshake, the tunnel, or our credentials.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// The mail server rejected the login.
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Message parsing error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancellation was requested while waiting for an update.
    #[error("Watch cancelled")]
    Cancelled,

    /// The session died. Terminal: the client does not reconnect.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Dispatch loop is already running")]
    AlreadyRunning,

    #[error("Client is closed")]
    Closed,

    /// The dispatch loop panicked or its task was torn down before it
    /// could report an outcome.
    #[error("Dispatch loop aborted")]
    Aborted,
}

impl Error {
    /// Whether this error ends a watch session for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
