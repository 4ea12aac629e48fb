// Stream administration, acked publishes, and scheduled delivery headers.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_wire::{subject, Payload};

use crate::client::Client;
use crate::jetstream::{
    parse_api_value, Js, HEADER_MSG_ID, HEADER_SCHEDULE, HEADER_SCHEDULE_TARGET,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    Workqueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    S2,
}

/// Defaults applied to consumers created on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsumerLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_threshold: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
}

/// Stream configuration as serialised to the admin API. Unset optional
/// fields are omitted from the wire form; `allow_msg_schedules` stays
/// `None` when the broker predates it and is never sent back as `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Immutable after create.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    pub storage: StorageType,
    #[serde(rename = "num_replicas")]
    pub replicas: u32,
    /// Nanoseconds; zero means unlimited.
    #[serde(rename = "max_age")]
    pub max_age_ns: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<i64>,
    pub max_consumers: i64,
    #[serde(rename = "max_msg_size", skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<i32>,
    #[serde(
        rename = "max_msgs_per_subject",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_messages_per_subject: Option<i64>,
    /// Nanoseconds of `Nats-Msg-Id` deduplication.
    #[serde(rename = "duplicate_window", skip_serializing_if = "Option::is_none")]
    pub duplicate_window_ns: Option<i64>,
    pub compression: Compression,
    #[serde(rename = "allow_rollup_hdrs")]
    pub allow_rollup_headers: bool,
    pub deny_delete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_limits: Option<ConsumerLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_msg_schedules: Option<bool>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            subjects: Vec::new(),
            retention: RetentionPolicy::Limits,
            discard: DiscardPolicy::Old,
            storage: StorageType::File,
            replicas: 1,
            max_age_ns: 0,
            max_bytes: None,
            max_consumers: -1,
            max_message_size: None,
            max_messages_per_subject: None,
            duplicate_window_ns: None,
            compression: Compression::None,
            allow_rollup_headers: false,
            deny_delete: false,
            consumer_limits: None,
            allow_msg_schedules: None,
        }
    }
}

impl StreamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn subjects<S: Into<String>>(mut self, subjects: impl IntoIterator<Item = S>) -> Self {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn discard(mut self, discard: DiscardPolicy) -> Self {
        self.discard = discard;
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age_ns = age.as_nanos() as i64;
        self
    }

    #[must_use]
    pub fn max_messages_per_subject(mut self, max: i64) -> Self {
        self.max_messages_per_subject = Some(max);
        self
    }

    #[must_use]
    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window_ns = Some(window.as_nanos() as i64);
        self
    }

    #[must_use]
    pub fn allow_rollup_headers(mut self) -> Self {
        self.allow_rollup_headers = true;
        self
    }

    #[must_use]
    pub fn allow_msg_schedules(mut self) -> Self {
        self.allow_msg_schedules = Some(true);
        self
    }
}

/// Counters reported by `STREAM.INFO`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub state: StreamState,
}

/// Acked-publish response.
#[derive(Debug, Clone, Deserialize)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
    #[serde(default)]
    pub duplicate: bool,
}

/// Body of `STREAM.PURGE`; an empty request purges everything.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<u64>,
}

/// Schedule specifier rendered into the `Nats-Schedule` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Single delivery at an RFC 3339 UTC instant; past instants deliver
    /// immediately.
    At(String),
    /// Repeating interval, rendered in the coarsest exact unit.
    Every(Duration),
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    /// Six-field cron: `sec min hour dom mon dow`.
    Cron(String),
}

impl Schedule {
    pub fn render(&self) -> String {
        match self {
            Self::At(instant) => format!("@at {instant}"),
            Self::Every(interval) => format!("@every {}", render_interval(*interval)),
            Self::Hourly => "@hourly".to_string(),
            Self::Daily => "@daily".to_string(),
            Self::Weekly => "@weekly".to_string(),
            Self::Monthly => "@monthly".to_string(),
            Self::Yearly => "@yearly".to_string(),
            Self::Cron(expr) => expr.clone(),
        }
    }
}

// The duration grammar is `<integer><unit>` with unit in s|m|h.
fn render_interval(interval: Duration) -> String {
    let secs = interval.as_secs().max(1);
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

impl Js {
    /// `STREAM.CREATE`. Creating an existing stream with an identical
    /// config is idempotent on the broker side.
    pub fn create_stream(&self, client: &mut Client, config: StreamConfig) -> Result<Stream> {
        ensure_name(&config.name)?;
        let op = format!("STREAM.CREATE.{}", config.name);
        let value = self.api_request(client, &op, serde_json::to_vec(&config)?)?;
        Ok(Stream {
            config: config_from(value, config)?,
            prefix: self.prefix().to_string(),
        })
    }

    /// `STREAM.INFO` against an existing stream.
    pub fn get_stream(&self, client: &mut Client, name: &str) -> Result<Stream> {
        ensure_name(name)?;
        let op = format!("STREAM.INFO.{name}");
        let value = self.api_request(client, &op, Vec::new())?;
        Ok(Stream {
            config: config_from(value, StreamConfig::new(name))?,
            prefix: self.prefix().to_string(),
        })
    }

    /// Info first, create on not-found.
    pub fn create_stream_if_not_exists(
        &self,
        client: &mut Client,
        config: StreamConfig,
    ) -> Result<Stream> {
        match self.get_stream(client, &config.name) {
            Ok(stream) => Ok(stream),
            Err(err) if super::is_not_found(&err) => self.create_stream(client, config),
            Err(err) => Err(err),
        }
    }

    pub fn delete_stream(&self, client: &mut Client, name: &str) -> Result<()> {
        ensure_name(name)?;
        self.api_request(client, &format!("STREAM.DELETE.{name}"), Vec::new())?;
        Ok(())
    }

    /// `STREAM.NAMES`.
    pub fn stream_names(&self, client: &mut Client) -> Result<Vec<String>> {
        let value = self.api_request(client, "STREAM.NAMES", Vec::new())?;
        match value.get("streams") {
            Some(streams) if !streams.is_null() => Ok(serde_json::from_value(streams.clone())?),
            _ => Ok(Vec::new()),
        }
    }

    /// `STREAM.LIST` with full config and state per stream.
    pub fn streams(&self, client: &mut Client) -> Result<Vec<StreamInfo>> {
        let value = self.api_request(client, "STREAM.LIST", Vec::new())?;
        match value.get("streams") {
            Some(streams) if !streams.is_null() => Ok(serde_json::from_value(streams.clone())?),
            _ => Ok(Vec::new()),
        }
    }
}

/// Handle over one logical stream, carrying its mutable cached config.
#[derive(Debug, Clone)]
pub struct Stream {
    pub(crate) config: StreamConfig,
    pub(crate) prefix: String,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn js(&self) -> Js {
        Js::with_prefix(self.prefix.clone())
    }

    /// `STREAM.INFO`, refreshing the cached config from the response.
    pub fn info(&mut self, client: &mut Client) -> Result<StreamInfo> {
        let op = format!("STREAM.INFO.{}", self.config.name);
        let value = self.js().api_request(client, &op, Vec::new())?;
        let info: StreamInfo = serde_json::from_value(value)?;
        self.config = info.config.clone();
        Ok(info)
    }

    /// `STREAM.UPDATE` with a new config; the name cannot change.
    pub fn update(&mut self, client: &mut Client, config: StreamConfig) -> Result<()> {
        if config.name != self.config.name {
            return Err(Error::Config(format!(
                "stream name is immutable: {} -> {}",
                self.config.name, config.name
            )));
        }
        let op = format!("STREAM.UPDATE.{}", config.name);
        let value = self.js().api_request(client, &op, serde_json::to_vec(&config)?)?;
        self.config = config_from(value, config)?;
        Ok(())
    }

    pub fn delete(self, client: &mut Client) -> Result<()> {
        let op = format!("STREAM.DELETE.{}", self.config.name);
        self.js().api_request(client, &op, Vec::new())?;
        Ok(())
    }

    /// Full purge of the stream's messages.
    pub fn purge(&self, client: &mut Client) -> Result<()> {
        self.purge_with(client, PurgeRequest::default())
    }

    /// Purge bounded by filter subject, sequence, or keep count.
    pub fn purge_with(&self, client: &mut Client, request: PurgeRequest) -> Result<()> {
        let op = format!("STREAM.PURGE.{}", self.config.name);
        self.js()
            .api_request(client, &op, serde_json::to_vec(&request)?)?;
        Ok(())
    }

    /// True when the stream's subject set captures `subject_name`.
    pub fn covers(&self, subject_name: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject_name))
    }

    fn ensure_covers(&self, subject_name: &str) -> Result<()> {
        if self.config.subjects.is_empty() || self.covers(subject_name) {
            Ok(())
        } else {
            Err(Error::SubjectNotCovered {
                subject: subject_name.to_string(),
                stream: self.config.name.clone(),
            })
        }
    }

    /// Unacked publish: a plain `PUB` on the subject.
    pub fn put(
        &self,
        client: &mut Client,
        subject_name: &str,
        payload: impl Into<Payload>,
    ) -> Result<()> {
        self.ensure_covers(subject_name)?;
        client.publish(subject_name, payload)
    }

    /// Acked publish: request/reply on the subject, returning the broker's
    /// `PubAck`. With a `Nats-Msg-Id` header, `duplicate` reports a
    /// suppressed re-publish inside the duplicate window.
    pub fn publish(
        &self,
        client: &mut Client,
        subject_name: &str,
        payload: impl Into<Payload>,
    ) -> Result<PubAck> {
        self.ensure_covers(subject_name)?;
        let reply = client.dispatch(subject_name, payload, None)?;
        let value = parse_api_value(&reply.payload.body)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Acked publish carrying a deduplication id.
    pub fn publish_with_id(
        &self,
        client: &mut Client,
        subject_name: &str,
        msg_id: &str,
        payload: impl Into<Payload>,
    ) -> Result<PubAck> {
        let mut payload = payload.into();
        payload.headers.insert(HEADER_MSG_ID, msg_id);
        self.publish(client, subject_name, payload)
    }

    /// Enqueue a scheduled message: the broker later produces the payload
    /// on `target`, which must be covered by this stream.
    pub fn publish_scheduled(
        &self,
        client: &mut Client,
        subject_name: &str,
        schedule: &Schedule,
        target: &str,
        payload: impl Into<Payload>,
    ) -> Result<PubAck> {
        self.ensure_covers(target)?;
        let mut payload = payload.into();
        payload.headers.insert(HEADER_SCHEDULE, schedule.render());
        payload.headers.insert(HEADER_SCHEDULE_TARGET, target);
        self.publish(client, subject_name, payload)
    }
}

// Prefer the broker's view of the config; fall back to what we sent when
// the response omits it.
fn config_from(value: serde_json::Value, sent: StreamConfig) -> Result<StreamConfig> {
    match value.get("config") {
        Some(config) if !config.is_null() => Ok(serde_json::from_value(config.clone())?),
        _ => Ok(sent),
    }
}

fn ensure_name(name: &str) -> Result<()> {
    if !name.is_empty() && !name.contains(['.', ' ', '*', '>', '\t']) {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid stream name: {name:?}")))
    }
}
