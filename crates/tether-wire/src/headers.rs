// Ordered header map and the `NATS/1.0` header block codec.
use bytes::{BufMut, BytesMut};

use crate::{Error, Result};

pub const HEADER_VERSION: &str = "NATS/1.0";

/// Synthetic key injected when the version line carries a status code.
pub const STATUS_CODE: &str = "Status-Code";
/// Synthetic key injected when the version line carries a status message.
pub const STATUS_MESSAGE: &str = "Status-Message";

/// Ordered multi-map of message headers.
///
/// Keys are case-sensitive and duplicates are allowed; lookups return the
/// last value written for a key.
///
/// ```
/// use tether_wire::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("Nats-Msg-Id", "a");
/// headers.insert("Nats-Msg-Id", "b");
/// assert_eq!(headers.get("Nats-Msg-Id"), Some("b"));
/// assert_eq!(headers.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Last value recorded for `key`, exact-case match.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Decode a header block: version line, `Key: Value` lines, blank
    /// terminator. A status on the version line becomes the synthetic
    /// `Status-Code` / `Status-Message` entries.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if !block.ends_with(b"\r\n\r\n") {
            return Err(Error::UnterminatedHeaders);
        }
        let text = std::str::from_utf8(&block[..block.len() - 4])
            .map_err(|_| Error::BadHeaderVersion)?;
        let mut lines = text.split("\r\n");

        let version = lines.next().unwrap_or_default();
        let rest = version
            .strip_prefix(HEADER_VERSION)
            .ok_or(Error::BadHeaderVersion)?;
        let mut headers = Self::new();
        let status = rest.trim();
        if !status.is_empty() {
            match status.split_once(' ') {
                Some((code, message)) => {
                    headers.insert(STATUS_CODE, code);
                    headers.insert(STATUS_MESSAGE, message.trim());
                }
                None => headers.insert(STATUS_CODE, status),
            }
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::BadHeaderLine(line.to_string()))?;
            headers.insert(key, value.trim());
        }
        Ok(headers)
    }

    /// Encode the block, version line first. Synthetic status entries are
    /// folded back onto the version line rather than emitted as headers.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(HEADER_VERSION.as_bytes());
        if let Some(code) = self.get(STATUS_CODE) {
            buf.put_u8(b' ');
            buf.put_slice(code.as_bytes());
            if let Some(message) = self.get(STATUS_MESSAGE) {
                buf.put_u8(b' ');
                buf.put_slice(message.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
        for (key, value) in self.iter() {
            if key == STATUS_CODE || key == STATUS_MESSAGE {
                continue;
            }
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }

    pub fn encoded_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
