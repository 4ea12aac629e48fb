// Key-value bucket layered on a stream: revision-checked updates,
// tombstones, and ordered-consumer scans.
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use std::time::Duration;
use tether_wire::{subject, HeaderMap, Payload};
use tracing::debug;

use crate::client::Client;
use crate::jetstream::consumer::{AckPolicy, ConsumerConfig, DeliverPolicy};
use crate::jetstream::stream::{DiscardPolicy, Stream, StreamConfig};
use crate::jetstream::{Js, HEADER_EXPECTED_LAST_SUBJECT_SEQUENCE, HEADER_ROLLUP};
use crate::{Error, Result};

/// Header marking delete/purge tombstones.
pub const HEADER_KV_OPERATION: &str = "KV-Operation";
const OP_DELETE: &str = "DEL";
const OP_PURGE: &str = "PURGE";
const ROLLUP_SUBJECT: &str = "sub";
const SCAN_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

/// One revision of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    pub operation: KvOperation,
}

impl KvEntry {
    pub fn is_tombstone(&self) -> bool {
        !matches!(self.operation, KvOperation::Put)
    }
}

/// Bucket `X` backed by stream `KV_X` with subjects `$KV.X.>`. Keeps
/// `history` revisions per key and allows rollup tombstones.
pub struct KvBucket {
    name: String,
    stream: Stream,
    history: i64,
}

impl KvBucket {
    /// Create the backing stream (or adopt an existing one).
    pub fn create(client: &mut Client, js: &Js, name: &str, history: i64) -> Result<Self> {
        ensure_bucket_name(name)?;
        let config = StreamConfig::new(format!("KV_{name}"))
            .subjects([format!("$KV.{name}.>")])
            .discard(DiscardPolicy::New)
            .max_messages_per_subject(history.max(1))
            .allow_rollup_headers();
        let stream = js.create_stream_if_not_exists(client, config)?;
        Ok(Self {
            name: name.to_string(),
            stream,
            history: history.max(1),
        })
    }

    /// Bind to an existing bucket.
    pub fn open(client: &mut Client, js: &Js, name: &str) -> Result<Self> {
        ensure_bucket_name(name)?;
        let stream = js.get_stream(client, &format!("KV_{name}"))?;
        let history = stream.config().max_messages_per_subject.unwrap_or(1);
        Ok(Self {
            name: name.to_string(),
            stream,
            history,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn history(&self) -> i64 {
        self.history
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    fn key_subject(&self, key: &str) -> Result<String> {
        subject::ensure_publish(key)?;
        Ok(format!("$KV.{}.{key}", self.name))
    }

    fn key_from_subject<'s>(&self, subject_name: &'s str) -> &'s str {
        subject_name
            .strip_prefix("$KV.")
            .and_then(|rest| rest.strip_prefix(&self.name))
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(subject_name)
    }

    /// Write a value; the stream sequence is the key's new revision.
    pub fn put(&self, client: &mut Client, key: &str, value: impl Into<Payload>) -> Result<u64> {
        let subject_name = self.key_subject(key)?;
        let ack = self.stream.publish(client, &subject_name, value)?;
        Ok(ack.seq)
    }

    /// Direct last-per-subject read. Tombstoned keys read as absent.
    pub fn get(&self, client: &mut Client, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entry(client, key)?.and_then(|entry| {
            if entry.is_tombstone() {
                None
            } else {
                Some(entry.value)
            }
        }))
    }

    /// Last revision of the key, tombstones included.
    pub fn entry(&self, client: &mut Client, key: &str) -> Result<Option<KvEntry>> {
        let subject_name = self.key_subject(key)?;
        let js = Js::with_prefix(self.stream.prefix.clone());
        let op = format!("STREAM.MSG.GET.{}", self.stream.name());
        let body = serde_json::to_vec(&serde_json::json!({ "last_by_subj": subject_name }))?;
        let value = match js.api_request(client, &op, body) {
            Ok(value) => value,
            Err(err) if super::is_not_found(&err) || err.api_code() == Some(10037) => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let Some(message) = value.get("message") else {
            return Ok(None);
        };

        let headers = match message.get("hdrs").and_then(|hdrs| hdrs.as_str()) {
            Some(encoded) => {
                let block = STANDARD
                    .decode(encoded)
                    .map_err(|err| Error::Server(format!("bad message header block: {err}")))?;
                HeaderMap::decode(&block)?
            }
            None => HeaderMap::new(),
        };
        let data = match message.get("data").and_then(|data| data.as_str()) {
            Some(encoded) => Bytes::from(
                STANDARD
                    .decode(encoded)
                    .map_err(|err| Error::Server(format!("bad message body: {err}")))?,
            ),
            None => Bytes::new(),
        };
        let revision = message.get("seq").and_then(|seq| seq.as_u64()).unwrap_or(0);
        Ok(Some(KvEntry {
            key: key.to_string(),
            value: data,
            revision,
            operation: operation_from(&headers),
        }))
    }

    /// Compare-and-set write: succeeds only while `expected` is still the
    /// key's last revision.
    pub fn update(
        &self,
        client: &mut Client,
        key: &str,
        value: impl Into<Payload>,
        expected: u64,
    ) -> Result<u64> {
        let subject_name = self.key_subject(key)?;
        let mut payload = value.into();
        payload.headers.insert(
            HEADER_EXPECTED_LAST_SUBJECT_SEQUENCE,
            expected.to_string(),
        );
        match self.stream.publish(client, &subject_name, payload) {
            Ok(ack) => Ok(ack.seq),
            Err(err) if err.api_code() == Some(10071) => Err(Error::RevisionMismatch {
                key: key.to_string(),
                expected,
            }),
            Err(err) => Err(err),
        }
    }

    /// Append a delete tombstone; history for the key is preserved.
    pub fn delete(&self, client: &mut Client, key: &str) -> Result<()> {
        let subject_name = self.key_subject(key)?;
        let mut payload = Payload::default();
        payload.headers.insert(HEADER_KV_OPERATION, OP_DELETE);
        self.stream.publish(client, &subject_name, payload)?;
        Ok(())
    }

    /// Roll the key up to a single purge tombstone, compacting its
    /// history away.
    pub fn purge(&self, client: &mut Client, key: &str) -> Result<()> {
        let subject_name = self.key_subject(key)?;
        let mut payload = Payload::default();
        payload.headers.insert(HEADER_KV_OPERATION, OP_PURGE);
        payload.headers.insert(HEADER_ROLLUP, ROLLUP_SUBJECT);
        self.stream.publish(client, &subject_name, payload)?;
        Ok(())
    }

    /// Latest live entry per key, via a transient last-per-subject scan.
    pub fn entries(&self, client: &mut Client) -> Result<Vec<KvEntry>> {
        let scanned = self.scan(
            client,
            ConsumerConfig::ephemeral()
                .deliver_policy(DeliverPolicy::LastPerSubject)
                .ack_policy(AckPolicy::None)
                .filter_subject(format!("$KV.{}.>", self.name))
                .inactive_threshold(Duration::from_secs(5)),
        )?;
        Ok(scanned
            .into_iter()
            .filter(|entry| !entry.is_tombstone())
            .collect())
    }

    pub fn keys(&self, client: &mut Client) -> Result<Vec<String>> {
        Ok(self
            .entries(client)?
            .into_iter()
            .map(|entry| entry.key)
            .collect())
    }

    /// Every retained revision of one key, oldest first, tombstones
    /// included.
    pub fn history_of(&self, client: &mut Client, key: &str) -> Result<Vec<KvEntry>> {
        let subject_name = self.key_subject(key)?;
        self.scan(
            client,
            ConsumerConfig::ephemeral()
                .ack_policy(AckPolicy::None)
                .filter_subject(subject_name)
                .inactive_threshold(Duration::from_secs(5)),
        )
    }

    fn scan(&self, client: &mut Client, config: ConsumerConfig) -> Result<Vec<KvEntry>> {
        let mut consumer = self.stream.create_consumer(client, config)?;
        consumer.expires = Duration::ZERO;
        let mut entries = Vec::new();
        loop {
            let batch = consumer.fetch(client, SCAN_BATCH)?;
            let done = batch.len() < SCAN_BATCH;
            for msg in batch {
                let revision = msg.meta.as_ref().map(|meta| meta.stream_seq).unwrap_or(0);
                entries.push(KvEntry {
                    key: self.key_from_subject(&msg.message.subject).to_string(),
                    value: msg.message.payload.body.clone(),
                    revision,
                    operation: operation_from(&msg.message.payload.headers),
                });
            }
            if done {
                break;
            }
        }
        if let Err(err) = consumer.delete(client) {
            debug!(error = %err, bucket = %self.name, "scan consumer cleanup failed");
        }
        Ok(entries)
    }
}

fn operation_from(headers: &HeaderMap) -> KvOperation {
    match headers.get(HEADER_KV_OPERATION) {
        Some(OP_DELETE) => KvOperation::Delete,
        Some(OP_PURGE) => KvOperation::Purge,
        _ => KvOperation::Put,
    }
}

fn ensure_bucket_name(name: &str) -> Result<()> {
    if !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid bucket name: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> KvBucket {
        KvBucket {
            name: "conf".to_string(),
            stream: Stream {
                config: StreamConfig::new("KV_conf").subjects(["$KV.conf.>"]),
                prefix: super::super::DEFAULT_API_PREFIX.to_string(),
            },
            history: 5,
        }
    }

    #[test]
    fn key_subjects_live_under_the_bucket_prefix() {
        let bucket = bucket();
        assert_eq!(
            bucket.key_subject("region.eu").expect("subject"),
            "$KV.conf.region.eu"
        );
        assert!(bucket.key_subject("bad key").is_err());
        assert!(bucket.key_subject("no.wildcards.*").is_err());
    }

    #[test]
    fn keys_round_trip_through_subjects() {
        let bucket = bucket();
        let subject_name = bucket.key_subject("region.eu").expect("subject");
        assert_eq!(bucket.key_from_subject(&subject_name), "region.eu");
    }

    #[test]
    fn tombstone_detection_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(operation_from(&headers), KvOperation::Put);
        headers.insert(HEADER_KV_OPERATION, OP_DELETE);
        assert_eq!(operation_from(&headers), KvOperation::Delete);
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_KV_OPERATION, OP_PURGE);
        assert_eq!(operation_from(&headers), KvOperation::Purge);
    }

    #[test]
    fn bucket_names_are_restricted() {
        assert!(ensure_bucket_name("app-config_1").is_ok());
        assert!(ensure_bucket_name("bad.name").is_err());
        assert!(ensure_bucket_name("").is_err());
    }
}
