// Client error taxonomy: connection, authentication, protocol, timeout,
// JetStream API, domain, and logic kinds.
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid server name for tls verification: {0}")]
    ServerName(String),
    #[error("connection closed")]
    Closed,
    #[error("authorization rejected: {0}")]
    Auth(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] tether_wire::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("jetstream api error {code}: {description}")]
    Api { code: u32, description: String },
    #[error("revision mismatch on key {key}: expected {expected}")]
    RevisionMismatch { key: String, expected: u64 },
    #[error("subject {subject} is not covered by stream {stream}")]
    SubjectNotCovered { subject: String, stream: String },
    #[error("no reply subject to respond on")]
    NoReplySubject,
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify a `-ERR` line. Authorization failures are terminal and must
    /// never be retried by the reconnect layer.
    pub(crate) fn from_server_err(text: String) -> Self {
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("authorization") || lowered.contains("authentication") {
            Self::Auth(text)
        } else {
            Self::Server(text)
        }
    }

    /// Numeric JetStream API code, when this is an API error.
    pub fn api_code(&self) -> Option<u32> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Errors the reconnect layer may recover from locally.
    pub(crate) fn is_reconnectable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed)
    }
}
