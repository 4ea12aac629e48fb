// Client defaults, environment overrides, and the reconnect delay schedule.
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

pub(crate) const DEFAULT_PORT: u16 = 4222;
pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_DELAY: Duration = Duration::from_millis(1);
pub(crate) const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;
pub(crate) const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

/// Back-off shape for the reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayMode {
    /// `d_n = d0`
    #[default]
    Constant,
    /// `d_n = d0 * (n + 1)`
    Linear,
    /// `d_n = d0 * 10^n`
    Exponential,
}

impl DelayMode {
    pub fn delay_for(self, base: Duration, attempt: u32) -> Duration {
        match self {
            Self::Constant => base,
            Self::Linear => base * (attempt + 1),
            // Clamp the exponent: past 10^9 the socket is not coming back.
            Self::Exponential => base * 10u32.pow(attempt.min(9)),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "constant" => Some(Self::Constant),
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Connection and behaviour options for a [`crate::Client`].
///
/// Built from compiled defaults, then `TETHER_*` environment variables,
/// then an optional YAML override file.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    pub jwt: Option<String>,
    /// Public NKey, sent as the `nkey` CONNECT field.
    pub nkey: Option<String>,
    /// NKey seed used to sign the server nonce. The public key is derived
    /// from the seed when `nkey` is unset.
    pub nkey_seed: Option<String>,
    pub name: Option<String>,
    pub inbox_prefix: String,
    pub ping_interval: Duration,
    pub timeout: Duration,
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_handshake_first: bool,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_ca_file: Option<PathBuf>,
    /// Accept any server certificate. Testing against self-signed brokers
    /// only.
    pub tls_insecure: bool,
    pub reconnect: bool,
    pub delay: Duration,
    pub delay_mode: DelayMode,
    pub reconnect_attempts: u32,
    /// Maximum bytes per socket write. `None` writes whole frames; small
    /// values exist for exercising the chunking path in tests.
    pub packet_size: Option<usize>,
    /// Log and drop undecodable frames instead of failing the read loop.
    pub skip_invalid_messages: bool,
    pub lang: String,
    pub version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            user: None,
            pass: None,
            token: None,
            jwt: None,
            nkey: None,
            nkey_seed: None,
            name: None,
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            verbose: false,
            pedantic: false,
            tls_handshake_first: false,
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
            tls_insecure: false,
            reconnect: true,
            delay: DEFAULT_DELAY,
            delay_mode: DelayMode::Constant,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            packet_size: None,
            skip_invalid_messages: false,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct OptionsOverride {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    pass: Option<String>,
    token: Option<String>,
    jwt: Option<String>,
    nkey: Option<String>,
    nkey_seed: Option<String>,
    name: Option<String>,
    inbox_prefix: Option<String>,
    /// Seconds.
    ping_interval: Option<f64>,
    /// Seconds.
    timeout: Option<f64>,
    verbose: Option<bool>,
    pedantic: Option<bool>,
    tls_handshake_first: Option<bool>,
    tls_cert_file: Option<PathBuf>,
    tls_key_file: Option<PathBuf>,
    tls_ca_file: Option<PathBuf>,
    tls_insecure: Option<bool>,
    reconnect: Option<bool>,
    /// Seconds.
    delay: Option<f64>,
    delay_mode: Option<String>,
    reconnect_attempts: Option<u32>,
    packet_size: Option<usize>,
    skip_invalid_messages: Option<bool>,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults layered with `TETHER_*` environment variables.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(value) = read_string_env("TETHER_HOST") {
            opts.host = value;
        }
        if let Some(value) = read_env("TETHER_PORT") {
            opts.port = value;
        }
        if let Some(value) = read_string_env("TETHER_USER") {
            opts.user = Some(value);
        }
        if let Some(value) = read_string_env("TETHER_PASS") {
            opts.pass = Some(value);
        }
        if let Some(value) = read_string_env("TETHER_TOKEN") {
            opts.token = Some(value);
        }
        if let Some(value) = read_string_env("TETHER_JWT") {
            opts.jwt = Some(value);
        }
        if let Some(value) = read_string_env("TETHER_NKEY") {
            opts.nkey = Some(value);
        }
        if let Some(value) = read_string_env("TETHER_NKEY_SEED") {
            opts.nkey_seed = Some(value);
        }
        if let Some(value) = read_string_env("TETHER_INBOX_PREFIX") {
            opts.inbox_prefix = value;
        }
        if let Some(value) = read_secs_env("TETHER_PING_INTERVAL") {
            opts.ping_interval = value;
        }
        if let Some(value) = read_secs_env("TETHER_TIMEOUT") {
            opts.timeout = value;
        }
        if let Some(value) = read_bool_env("TETHER_VERBOSE") {
            opts.verbose = value;
        }
        if let Some(value) = read_bool_env("TETHER_RECONNECT") {
            opts.reconnect = value;
        }
        if let Some(value) = read_secs_env("TETHER_DELAY") {
            opts.delay = value;
        }
        if let Some(value) = read_string_env("TETHER_DELAY_MODE").and_then(|v| DelayMode::parse(&v))
        {
            opts.delay_mode = value;
        }
        if let Some(value) = read_env("TETHER_RECONNECT_ATTEMPTS") {
            opts.reconnect_attempts = value;
        }
        if let Some(value) = read_env("TETHER_PACKET_SIZE") {
            opts.packet_size = Some(value);
        }
        if let Some(value) = read_bool_env("TETHER_SKIP_INVALID_MESSAGES") {
            opts.skip_invalid_messages = value;
        }
        opts
    }

    /// Env-layered defaults plus a YAML override file: the explicit path,
    /// else `TETHER_CONFIG`, else no file.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut opts = Self::from_env();
        let override_path = config_path
            .map(str::to_string)
            .or_else(|| std::env::var("TETHER_CONFIG").ok());
        if let Some(path) = override_path {
            let contents = fs::read_to_string(&path)
                .map_err(|err| Error::Config(format!("read {path}: {err}")))?;
            let override_cfg: OptionsOverride = serde_yaml::from_str(&contents)
                .map_err(|err| Error::Config(format!("parse {path}: {err}")))?;
            override_cfg.apply(&mut opts)?;
        }
        Ok(opts)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn wants_tls(&self) -> bool {
        self.tls_handshake_first
            || self.tls_ca_file.is_some()
            || self.tls_cert_file.is_some()
            || self.tls_insecure
    }
}

impl OptionsOverride {
    fn apply(self, opts: &mut ClientOptions) -> Result<()> {
        if let Some(value) = self.host {
            opts.host = value;
        }
        if let Some(value) = self.port {
            opts.port = value;
        }
        if let Some(value) = self.user {
            opts.user = Some(value);
        }
        if let Some(value) = self.pass {
            opts.pass = Some(value);
        }
        if let Some(value) = self.token {
            opts.token = Some(value);
        }
        if let Some(value) = self.jwt {
            opts.jwt = Some(value);
        }
        if let Some(value) = self.nkey {
            opts.nkey = Some(value);
        }
        if let Some(value) = self.nkey_seed {
            opts.nkey_seed = Some(value);
        }
        if let Some(value) = self.name {
            opts.name = Some(value);
        }
        if let Some(value) = self.inbox_prefix {
            opts.inbox_prefix = value;
        }
        if let Some(value) = self.ping_interval {
            opts.ping_interval = secs(value)?;
        }
        if let Some(value) = self.timeout {
            opts.timeout = secs(value)?;
        }
        if let Some(value) = self.verbose {
            opts.verbose = value;
        }
        if let Some(value) = self.pedantic {
            opts.pedantic = value;
        }
        if let Some(value) = self.tls_handshake_first {
            opts.tls_handshake_first = value;
        }
        if let Some(value) = self.tls_cert_file {
            opts.tls_cert_file = Some(value);
        }
        if let Some(value) = self.tls_key_file {
            opts.tls_key_file = Some(value);
        }
        if let Some(value) = self.tls_ca_file {
            opts.tls_ca_file = Some(value);
        }
        if let Some(value) = self.tls_insecure {
            opts.tls_insecure = value;
        }
        if let Some(value) = self.reconnect {
            opts.reconnect = value;
        }
        if let Some(value) = self.delay {
            opts.delay = secs(value)?;
        }
        if let Some(value) = self.delay_mode {
            opts.delay_mode = DelayMode::parse(&value)
                .ok_or_else(|| Error::Config(format!("unknown delay mode: {value}")))?;
        }
        if let Some(value) = self.reconnect_attempts {
            opts.reconnect_attempts = value;
        }
        if let Some(value) = self.packet_size {
            opts.packet_size = Some(value);
        }
        if let Some(value) = self.skip_invalid_messages {
            opts.skip_invalid_messages = value;
        }
        Ok(())
    }
}

fn secs(value: f64) -> Result<Duration> {
    if value.is_finite() && value >= 0.0 {
        Ok(Duration::from_secs_f64(value))
    } else {
        Err(Error::Config(format!("invalid duration: {value}")))
    }
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn read_secs_env(key: &str) -> Option<Duration> {
    read_env::<f64>(key).and_then(|value| secs(value).ok())
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
