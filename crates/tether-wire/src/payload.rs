// Subject-less message value: opaque body plus headers.
use bytes::Bytes;

use crate::headers::{HeaderMap, STATUS_CODE, STATUS_MESSAGE};

/// Body bytes and an ordered header map.
///
/// ```
/// use tether_wire::Payload;
///
/// let payload = Payload::from("hello");
/// assert_eq!(payload.body.as_ref(), b"hello");
/// assert!(payload.headers.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub body: Bytes,
    pub headers: HeaderMap,
}

impl Payload {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(body: impl Into<Bytes>, headers: HeaderMap) -> Self {
        Self {
            body: body.into(),
            headers,
        }
    }

    /// Parsed `Status-Code` header, if one was injected during decode.
    pub fn status_code(&self) -> Option<u16> {
        self.headers.get(STATUS_CODE)?.parse().ok()
    }

    pub fn status_message(&self) -> Option<&str> {
        self.headers.get(STATUS_MESSAGE)
    }

    /// Both 404 and 408 are "no messages" terminators on an empty pull;
    /// broker versions differ on which one they send.
    pub fn is_no_messages(&self) -> bool {
        matches!(self.status_code(), Some(404) | Some(408))
    }
}

impl From<&str> for Payload {
    fn from(body: &str) -> Self {
        Self::new(Bytes::copy_from_slice(body.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(body: String) -> Self {
        Self::new(Bytes::from(body.into_bytes()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(body: Vec<u8>) -> Self {
        Self::new(Bytes::from(body))
    }
}

impl From<Bytes> for Payload {
    fn from(body: Bytes) -> Self {
        Self::new(body)
    }
}
