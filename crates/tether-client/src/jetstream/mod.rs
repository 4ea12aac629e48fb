// JetStream: typed RPCs on `$JS.API.*`, streams, pull consumers, acks,
// and the stream-backed key-value bucket.
use serde::Deserialize;
use serde_json::Value;
use tether_wire::Payload;

use crate::client::Client;
use crate::{Error, Result};

pub mod ack;
pub mod consumer;
pub mod kv;
pub mod stream;

pub use ack::{Ack, Nak, Progress, Term};
pub use consumer::{
    AckPolicy, Consumer, ConsumerConfig, ConsumerInfo, DeliverPolicy, JsMessage, JsMetadata,
    ReplayPolicy,
};
pub use kv::{KvBucket, KvEntry, KvOperation};
pub use stream::{
    Compression, ConsumerLimits, DiscardPolicy, PubAck, PurgeRequest, RetentionPolicy, Schedule,
    StorageType, Stream, StreamConfig, StreamInfo, StreamState,
};

/// Deduplication key honoured within the stream's duplicate window.
pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";
/// Optimistic-concurrency guard on the subject's last sequence.
pub const HEADER_EXPECTED_LAST_SUBJECT_SEQUENCE: &str = "Nats-Expected-Last-Subject-Sequence";
/// Rollup tombstone: `sub` compacts one subject, `all` the whole stream.
pub const HEADER_ROLLUP: &str = "Nats-Rollup";
/// Schedule specifier consumed by brokers with message schedules enabled.
pub const HEADER_SCHEDULE: &str = "Nats-Schedule";
/// Subject a scheduled message is produced on.
pub const HEADER_SCHEDULE_TARGET: &str = "Nats-Schedule-Target";
/// Server-set origin subject on messages a schedule produced.
pub const HEADER_SCHEDULER: &str = "Nats-Scheduler";

pub const DEFAULT_API_PREFIX: &str = "$JS.API";

/// JetStream admin API bound to a prefix. Cheap to construct; obtained
/// per client through [`Client::jetstream`].
#[derive(Debug, Clone)]
pub struct Js {
    prefix: String,
}

impl Default for Js {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    err_code: u32,
    #[serde(default)]
    description: String,
}

/// JetStream account limits and usage, from `$JS.API.INFO`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountInfo {
    pub memory: u64,
    pub storage: u64,
    pub streams: u64,
    pub consumers: u64,
}

impl Js {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_API_PREFIX.to_string(),
        }
    }

    /// Custom API prefix, for import/export isolated accounts.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// One admin RPC: request/reply on `<prefix>.<op>` with a JSON body,
    /// surfacing `{error: {...}}` responses as [`Error::Api`].
    pub(crate) fn api_request(
        &self,
        client: &mut Client,
        op: &str,
        body: Vec<u8>,
    ) -> Result<Value> {
        let subject = format!("{}.{op}", self.prefix);
        let reply = client.dispatch(&subject, Payload::from(body), None)?;
        parse_api_value(&reply.payload.body)
    }

    pub fn account_info(&self, client: &mut Client) -> Result<AccountInfo> {
        let value = self.api_request(client, "INFO", Vec::new())?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Client {
    /// JetStream entry point with the default `$JS.API` prefix.
    pub fn jetstream(&self) -> Js {
        Js::new()
    }
}

/// Not-found codes used by create-if-not-exists style flows: the broad
/// 404 and the specific stream/consumer-not-found codes.
pub(crate) fn is_not_found(err: &Error) -> bool {
    matches!(err.api_code(), Some(404) | Some(10059) | Some(10014))
}

/// Parse an API response body, turning `{error: {...}}` into
/// [`Error::Api`] with the most specific code the broker sent.
pub(crate) fn parse_api_value(body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body)?;
    if let Some(error) = value.get("error") {
        let parsed: ApiError = serde_json::from_value(error.clone())?;
        // The specific err_code discriminates better than the broad
        // HTTP-style code when both are present.
        let code = if parsed.err_code != 0 {
            parsed.err_code
        } else {
            parsed.code
        };
        return Err(Error::Api {
            code,
            description: parsed.description,
        });
    }
    Ok(value)
}
