// Text wire protocol codec for the tether messaging client.
//
// Frames are CRLF-delimited control lines; PUB/HPUB/MSG/HMSG carry a binary
// body of declared length. Decoding is incremental: a partial frame leaves
// the input buffer untouched and yields `None`.

pub mod frame;
pub mod headers;
pub mod info;
pub mod payload;
pub mod subject;

pub use frame::{ClientOp, Message, ServerOp, MAX_CONTROL_LINE};
pub use headers::{HeaderMap, HEADER_VERSION, STATUS_CODE, STATUS_MESSAGE};
pub use info::{ConnectInfo, ServerInfo};
pub use payload::Payload;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed control line: {0}")]
    BadControlLine(String),
    #[error("unknown operation: {0}")]
    UnknownOp(String),
    #[error("invalid {field} field: {value}")]
    BadField { field: &'static str, value: String },
    #[error("header line without separator: {0}")]
    BadHeaderLine(String),
    #[error("header block missing version line")]
    BadHeaderVersion,
    #[error("header block not terminated")]
    UnterminatedHeaders,
    #[error("payload not terminated")]
    UnterminatedPayload,
    #[error("header length {hlen} exceeds total length {total}")]
    HeaderOverrun { hlen: usize, total: usize },
    #[error("invalid subject: {0}")]
    BadSubject(String),
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),
}
