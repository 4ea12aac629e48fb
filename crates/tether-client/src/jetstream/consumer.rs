// Pull consumers: creation, the batched pull loop, and the `$JS.ACK`
// reply-subject metadata.
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::time::{Duration, Instant};
use tether_wire::{Message, Payload};
use tracing::debug;

use crate::client::Client;
use crate::jetstream::ack::{Ack, Nak, Progress, Term};
use crate::jetstream::stream::Stream;
use crate::jetstream::{Js, HEADER_SCHEDULER};
use crate::queue::Queue;
use crate::{Error, Result};

/// Slack added on top of a pull's `expires` so the broker's own 408 can
/// arrive before the local deadline cuts the iteration short.
const EXPIRES_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    ByStartSequence,
    ByStartTime,
    Last,
    LastPerSubject,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    All,
    #[default]
    Explicit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Named durable cursor; `None` creates an ephemeral consumer whose
    /// name the broker assigns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub replay_policy: ReplayPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(rename = "ack_wait")]
    pub ack_wait_ns: i64,
    pub max_ack_pending: i64,
    #[serde(rename = "inactive_threshold", skip_serializing_if = "Option::is_none")]
    pub inactive_threshold_ns: Option<i64>,
    #[serde(rename = "backoff", skip_serializing_if = "Vec::is_empty")]
    pub backoff_ns: Vec<i64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            replay_policy: ReplayPolicy::Instant,
            filter_subject: None,
            ack_wait_ns: Duration::from_secs(30).as_nanos() as i64,
            max_ack_pending: 1000,
            inactive_threshold_ns: None,
            backoff_ns: Vec::new(),
        }
    }
}

impl ConsumerConfig {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn ephemeral() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    #[must_use]
    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    #[must_use]
    pub fn filter_subject(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }

    #[must_use]
    pub fn ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait_ns = wait.as_nanos() as i64;
        self
    }

    #[must_use]
    pub fn inactive_threshold(mut self, threshold: Duration) -> Self {
        self.inactive_threshold_ns = Some(threshold.as_nanos() as i64);
        self
    }

    #[must_use]
    pub fn backoff(mut self, steps: impl IntoIterator<Item = Duration>) -> Self {
        self.backoff_ns = steps
            .into_iter()
            .map(|step| step.as_nanos() as i64)
            .collect();
        self
    }
}

/// `CONSUMER.INFO` response counters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumerInfo {
    pub name: String,
    pub stream_name: String,
    pub config: ConsumerConfig,
    pub num_pending: u64,
    pub num_ack_pending: u64,
    pub num_redelivered: u64,
}

/// Sequence and timing metadata parsed from a `$JS.ACK` reply subject.
/// Unknown token counts parse to nothing rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsMetadata {
    pub domain: Option<String>,
    pub account_hash: Option<String>,
    pub stream: String,
    pub consumer: String,
    pub deliveries: u64,
    pub stream_seq: u64,
    pub consumer_seq: u64,
    pub timestamp_ns: i64,
    pub pending: u64,
}

impl JsMetadata {
    pub fn parse(reply: &str) -> Option<Self> {
        let tokens: Vec<&str> = reply.split('.').collect();
        if tokens.first() != Some(&"$JS") || tokens.get(1) != Some(&"ACK") {
            return None;
        }
        match tokens.len() {
            // $JS.ACK.<stream>.<consumer>.<deliveries>.<sseq>.<cseq>.<ts>.<pending>
            9 => Some(Self {
                domain: None,
                account_hash: None,
                stream: tokens[2].to_string(),
                consumer: tokens[3].to_string(),
                deliveries: tokens[4].parse().ok()?,
                stream_seq: tokens[5].parse().ok()?,
                consumer_seq: tokens[6].parse().ok()?,
                timestamp_ns: tokens[7].parse().ok()?,
                pending: tokens[8].parse().ok()?,
            }),
            // $JS.ACK.<domain>.<acc>.<stream>.<consumer>.<deliveries>.<sseq>.<cseq>.<ts>.<pending>.<rand>
            12 => Some(Self {
                domain: Some(tokens[2].to_string()),
                account_hash: Some(tokens[3].to_string()),
                stream: tokens[4].to_string(),
                consumer: tokens[5].to_string(),
                deliveries: tokens[6].parse().ok()?,
                stream_seq: tokens[7].parse().ok()?,
                consumer_seq: tokens[8].parse().ok()?,
                timestamp_ns: tokens[9].parse().ok()?,
                pending: tokens[10].parse().ok()?,
            }),
            _ => None,
        }
    }
}

/// One pulled delivery with parsed metadata and acknowledgement helpers.
/// Acks go out through the borrowed client; the message holds no
/// connection state of its own.
#[derive(Debug)]
pub struct JsMessage {
    pub message: Message,
    pub meta: Option<JsMetadata>,
}

impl JsMessage {
    pub fn from_message(message: Message) -> Self {
        let meta = message.reply.as_deref().and_then(JsMetadata::parse);
        Self { message, meta }
    }

    fn reply_subject(&self) -> Result<&str> {
        self.message.reply.as_deref().ok_or(Error::NoReplySubject)
    }

    pub fn ack(&self, client: &mut Client) -> Result<()> {
        client.send_op(&Ack::new(self.reply_subject()?).into())
    }

    /// Reschedule the delivery, after `delay` when given.
    pub fn nack(&self, client: &mut Client, delay: Option<Duration>) -> Result<()> {
        let mut frame = Nak::new(self.reply_subject()?);
        if let Some(delay) = delay {
            frame = frame.with_delay(delay);
        }
        client.send_op(&frame.into())
    }

    /// Reset the ack-wait timer without acknowledging.
    pub fn progress(&self, client: &mut Client) -> Result<()> {
        client.send_op(&Progress::new(self.reply_subject()?).into())
    }

    /// Drop the message permanently.
    pub fn term(&self, client: &mut Client, reason: Option<&str>) -> Result<()> {
        let mut frame = Term::new(self.reply_subject()?);
        if let Some(reason) = reason {
            frame = frame.with_reason(reason);
        }
        client.send_op(&frame.into())
    }

    /// Origin subject set by the broker on schedule-produced messages.
    pub fn scheduler(&self) -> Option<&str> {
        self.message.payload.headers.get(HEADER_SCHEDULER)
    }
}

/// Pull-mode consumer bound to a stream. Deliveries land on a private
/// subject and accumulate in a [`Queue`] until the handle loop drains
/// them.
pub struct Consumer {
    stream: String,
    name: String,
    prefix: String,
    config: ConsumerConfig,
    deliver_subject: String,
    queue: Queue,
    /// Messages requested per pull.
    pub batch: usize,
    /// Pull cycles per `handle` invocation.
    pub iterations: usize,
    /// Per-pull deadline; zero means no-wait, where an empty batch ends
    /// the loop early.
    pub expires: Duration,
    interrupted: Cell<bool>,
}

impl Stream {
    /// Create (or look up, for an identically configured durable) a pull
    /// consumer on this stream. Ephemeral consumers get their
    /// broker-assigned name captured on the handle.
    pub fn create_consumer(&self, client: &mut Client, config: ConsumerConfig) -> Result<Consumer> {
        let js = Js::with_prefix(self.prefix.clone());
        let op = match &config.durable_name {
            Some(durable) => format!("CONSUMER.DURABLE.CREATE.{}.{durable}", self.name()),
            None => format!("CONSUMER.CREATE.{}", self.name()),
        };
        let body = serde_json::json!({ "stream_name": self.name(), "config": config });
        let value = js.api_request(client, &op, serde_json::to_vec(&body)?)?;

        let name = value
            .get("name")
            .and_then(|name| name.as_str())
            .map(str::to_string)
            .or_else(|| config.durable_name.clone())
            .ok_or_else(|| Error::Server("consumer create response missing name".to_string()))?;
        let config = match value.get("config") {
            Some(parsed) if !parsed.is_null() => serde_json::from_value(parsed.clone())?,
            _ => config,
        };

        let deliver_subject = client.unique_subject("_PULL");
        let queue = client.subscribe_buffered(&deliver_subject)?;
        Ok(Consumer {
            stream: self.name().to_string(),
            name,
            prefix: self.prefix.clone(),
            config,
            deliver_subject,
            queue,
            batch: 10,
            iterations: 1,
            expires: Duration::from_secs(5),
            interrupted: Cell::new(false),
        })
    }
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Break out of `handle` cleanly; checked between iterations, so the
    /// in-flight batch still finishes.
    pub fn interrupt(&self) {
        self.interrupted.set(true);
    }

    /// Run the pull loop: `iterations` cycles of one batch request each,
    /// feeding every delivery to `on_message`. Returns the number of
    /// messages handled.
    pub fn handle<F>(&self, client: &mut Client, on_message: F) -> Result<usize>
    where
        F: FnMut(&mut Client, JsMessage) -> Result<()>,
    {
        self.run(client, on_message, |_| Ok(()))
    }

    /// As [`Consumer::handle`], with `on_empty` invoked whenever a pull
    /// comes back without messages.
    pub fn handle_with_empty<F, E>(
        &self,
        client: &mut Client,
        on_message: F,
        on_empty: E,
    ) -> Result<usize>
    where
        F: FnMut(&mut Client, JsMessage) -> Result<()>,
        E: FnMut(&mut Client) -> Result<()>,
    {
        self.run(client, on_message, on_empty)
    }

    fn run<F, E>(&self, client: &mut Client, mut on_message: F, mut on_empty: E) -> Result<usize>
    where
        F: FnMut(&mut Client, JsMessage) -> Result<()>,
        E: FnMut(&mut Client) -> Result<()>,
    {
        self.interrupted.set(false);
        let mut processed = 0usize;
        'iterations: for _ in 0..self.iterations.max(1) {
            if self.interrupted.get() {
                break;
            }
            self.send_next_request(client, self.batch.max(1))?;
            let deadline = Instant::now() + self.pull_budget(client);
            let mut received = 0usize;
            while received < self.batch.max(1) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.queue.fetch(client, remaining)? {
                    None => break,
                    Some(msg) if msg.payload.is_no_messages() => {
                        debug!(
                            status = msg.payload.status_code(),
                            consumer = %self.name,
                            "empty pull"
                        );
                        on_empty(client)?;
                        if self.expires.is_zero() {
                            break 'iterations;
                        }
                        break;
                    }
                    Some(msg) => {
                        received += 1;
                        processed += 1;
                        on_message(client, JsMessage::from_message(msg))?;
                    }
                }
            }
        }
        Ok(processed)
    }

    /// One pull of up to `max` messages, returned as a batch.
    pub fn fetch(&self, client: &mut Client, max: usize) -> Result<Vec<JsMessage>> {
        let max = max.max(1);
        self.send_next_request(client, max)?;
        let deadline = Instant::now() + self.pull_budget(client);
        let mut batch = Vec::new();
        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.queue.fetch(client, remaining)? {
                None => break,
                Some(msg) if msg.payload.is_no_messages() => break,
                Some(msg) => batch.push(JsMessage::from_message(msg)),
            }
        }
        Ok(batch)
    }

    pub fn info(&self, client: &mut Client) -> Result<ConsumerInfo> {
        let js = Js::with_prefix(self.prefix.clone());
        let op = format!("CONSUMER.INFO.{}.{}", self.stream, self.name);
        let value = js.api_request(client, &op, Vec::new())?;
        Ok(serde_json::from_value(value)?)
    }

    /// Delete the consumer on the broker and drop the delivery
    /// subscription.
    pub fn delete(self, client: &mut Client) -> Result<()> {
        let js = Js::with_prefix(self.prefix.clone());
        let op = format!("CONSUMER.DELETE.{}.{}", self.stream, self.name);
        js.api_request(client, &op, Vec::new())?;
        client.unsubscribe(self.queue.sid())
    }

    fn pull_budget(&self, client: &Client) -> Duration {
        if self.expires.is_zero() {
            // No-wait pulls still need room for the 404/408 round trip.
            client.options().timeout
        } else {
            self.expires + EXPIRES_GRACE
        }
    }

    fn send_next_request(&self, client: &mut Client, batch: usize) -> Result<()> {
        #[derive(Serialize)]
        struct NextRequest {
            batch: usize,
            #[serde(skip_serializing_if = "Option::is_none")]
            expires: Option<i64>,
            #[serde(skip_serializing_if = "std::ops::Not::not")]
            no_wait: bool,
        }
        let request = NextRequest {
            batch,
            expires: if self.expires.is_zero() {
                None
            } else {
                Some(self.expires.as_nanos() as i64)
            },
            no_wait: self.expires.is_zero(),
        };
        let subject = format!(
            "{}.CONSUMER.MSG.NEXT.{}.{}",
            self.prefix, self.stream, self.name
        );
        client.publish_with_reply(
            &subject,
            &self.deliver_subject,
            Payload::from(serde_json::to_vec(&request)?),
        )
    }
}

impl Js {
    /// `CONSUMER.NAMES` for one stream.
    pub fn consumer_names(&self, client: &mut Client, stream: &str) -> Result<Vec<String>> {
        let value = self.api_request(client, &format!("CONSUMER.NAMES.{stream}"), Vec::new())?;
        match value.get("consumers") {
            Some(consumers) if !consumers.is_null() => {
                Ok(serde_json::from_value(consumers.clone())?)
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_ack_reply() {
        let meta =
            JsMetadata::parse("$JS.ACK.mystream.myconsumer.1.3.18.1719992702186105579.0")
                .expect("metadata");
        assert_eq!(meta.stream, "mystream");
        assert_eq!(meta.consumer, "myconsumer");
        assert_eq!(meta.deliveries, 1);
        assert_eq!(meta.stream_seq, 3);
        assert_eq!(meta.consumer_seq, 18);
        assert_eq!(meta.timestamp_ns, 1_719_992_702_186_105_579);
        assert_eq!(meta.pending, 0);
        assert_eq!(meta.domain, None);
    }

    #[test]
    fn parses_v2_ack_reply() {
        let meta = JsMetadata::parse(
            "$JS.ACK.domain.ACCHASH.mystream.myconsumer.1.3.18.1719992702186105579.0.abc123",
        )
        .expect("metadata");
        assert_eq!(meta.domain.as_deref(), Some("domain"));
        assert_eq!(meta.account_hash.as_deref(), Some("ACCHASH"));
        assert_eq!(meta.stream, "mystream");
        assert_eq!(meta.timestamp_ns, 1_719_992_702_186_105_579);
    }

    #[test]
    fn other_token_counts_yield_no_metadata() {
        assert_eq!(JsMetadata::parse("$JS.ACK.stream.consumer.1.3.18"), None);
        assert_eq!(
            JsMetadata::parse("$JS.ACK.a.b.c.d.e.f.g.h"),
            None,
            "ten tokens"
        );
        assert_eq!(JsMetadata::parse("_INBOX.abc.7"), None);
    }

    #[test]
    fn non_numeric_sequence_tokens_yield_no_metadata() {
        assert_eq!(
            JsMetadata::parse("$JS.ACK.stream.consumer.one.3.18.1719992702186105579.0"),
            None
        );
    }

    #[test]
    fn consumer_config_defaults_serialise_compactly() {
        let json = serde_json::to_string(&ConsumerConfig::default()).expect("serialize");
        assert!(!json.contains("durable_name"));
        assert!(!json.contains("filter_subject"));
        assert!(!json.contains("backoff"));
        assert!(json.contains("\"ack_policy\":\"explicit\""));
        assert!(json.contains("\"ack_wait\":30000000000"));
    }

    #[test]
    fn consumer_config_round_trips() {
        let config = ConsumerConfig::durable("worker")
            .deliver_policy(DeliverPolicy::LastPerSubject)
            .filter_subject("orders.eu.>")
            .ack_wait(Duration::from_secs(10))
            .inactive_threshold(Duration::from_secs(60))
            .backoff([Duration::from_secs(1), Duration::from_secs(5)]);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: ConsumerConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn deliver_policy_wire_strings() {
        assert_eq!(
            serde_json::to_string(&DeliverPolicy::ByStartSequence).expect("json"),
            "\"by_start_sequence\""
        );
        assert_eq!(
            serde_json::to_string(&DeliverPolicy::LastPerSubject).expect("json"),
            "\"last_per_subject\""
        );
    }
}
