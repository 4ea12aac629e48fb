// Scripted in-process broker for the integration tests: accepts one
// client at a time, tracks subscriptions, fans publishes back out, and
// can drop the connection on demand.
#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tether_client::ClientOptions;
use tether_wire::subject;

/// One recorded inbound publish, headers still in the raw body.
#[derive(Debug, Clone)]
pub struct PubFrame {
    pub subject: String,
    pub reply: Option<String>,
    pub hlen: usize,
    pub raw: Vec<u8>,
}

impl PubFrame {
    pub fn body(&self) -> &[u8] {
        &self.raw[self.hlen..]
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }

    pub fn header_block(&self) -> String {
        String::from_utf8_lossy(&self.raw[..self.hlen]).into_owned()
    }

    pub fn header(&self, key: &str) -> Option<String> {
        self.header_block().lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k == key).then(|| v.trim().to_string())
        })
    }
}

/// One frame the mock writes in response to a routed publish.
#[derive(Clone)]
pub struct MockReply {
    pub reply: Option<String>,
    pub header_block: Option<String>,
    pub body: Vec<u8>,
    /// Verbatim bytes instead of a framed message; for protocol-error
    /// injection.
    pub raw: Option<Vec<u8>>,
}

impl MockReply {
    pub fn body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: None,
            header_block: None,
            body: body.into(),
            raw: None,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::body(value.to_string().into_bytes())
    }

    pub fn status(code: u16, message: &str) -> Self {
        Self {
            reply: None,
            header_block: Some(format!("NATS/1.0 {code} {message}\r\n\r\n")),
            body: Vec::new(),
            raw: None,
        }
    }

    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: None,
            header_block: None,
            body: Vec::new(),
            raw: Some(bytes.into()),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

type Responder = Box<dyn Fn(&PubFrame) -> Vec<MockReply> + Send + Sync>;

#[derive(Default)]
struct Shared {
    live_subs: Mutex<Vec<(u64, String)>>,
    sub_history: Mutex<Vec<(u64, String)>>,
    pubs: Mutex<Vec<PubFrame>>,
    last_connect: Mutex<Option<String>>,
    connects: AtomicUsize,
    pings: AtomicUsize,
    kill: AtomicBool,
    done: AtomicBool,
}

struct MockConfig {
    verbose: bool,
    nonce: Option<String>,
    responders: Vec<(String, Responder)>,
}

pub struct MockBrokerBuilder {
    config: MockConfig,
}

impl MockBrokerBuilder {
    pub fn new() -> Self {
        Self {
            config: MockConfig {
                verbose: false,
                nonce: None,
                responders: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.config.verbose = true;
        self
    }

    #[must_use]
    pub fn auth_nonce(mut self, nonce: &str) -> Self {
        self.config.nonce = Some(nonce.to_string());
        self
    }

    /// Route publishes matching `pattern` (with a reply subject) through
    /// `responder` instead of the normal fan-out.
    #[must_use]
    pub fn respond<F>(mut self, pattern: &str, responder: F) -> Self
    where
        F: Fn(&PubFrame) -> Vec<MockReply> + Send + Sync + 'static,
    {
        self.config
            .responders
            .push((pattern.to_string(), Box::new(responder)));
        self
    }

    pub fn start(self) -> MockBroker {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock broker");
        listener.set_nonblocking(true).expect("nonblocking accept");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let config = self.config;
        let handle = std::thread::spawn(move || {
            accept_loop(&listener, &thread_shared, &config);
        });
        MockBroker {
            addr,
            shared,
            handle: Some(handle),
        }
    }
}

pub struct MockBroker {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl MockBroker {
    pub fn start() -> Self {
        MockBrokerBuilder::new().start()
    }

    /// Client options pointed at the mock, tuned for fast tests.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            timeout: Duration::from_secs(2),
            delay: Duration::from_millis(1),
            ..ClientOptions::default()
        }
    }

    /// Drop the current connection server-side.
    pub fn kill_connection(&self) {
        self.shared.kill.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    pub fn sub_history(&self) -> Vec<(u64, String)> {
        self.shared.sub_history.lock().expect("lock").clone()
    }

    pub fn pubs(&self) -> Vec<PubFrame> {
        self.shared.pubs.lock().expect("lock").clone()
    }

    pub fn pubs_on(&self, subject_name: &str) -> Vec<PubFrame> {
        self.pubs()
            .into_iter()
            .filter(|frame| frame.subject == subject_name)
            .collect()
    }

    pub fn last_connect(&self) -> Option<serde_json::Value> {
        self.shared
            .last_connect
            .lock()
            .expect("lock")
            .as_ref()
            .and_then(|json| serde_json::from_str(json).ok())
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shared.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: &TcpListener, shared: &Shared, config: &MockConfig) {
    loop {
        if shared.done.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                shared.kill.store(false, Ordering::SeqCst);
                shared.connects.fetch_add(1, Ordering::SeqCst);
                serve(stream, shared, config);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    }
}

struct ServerConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ServerConn {
    // Ok(true) = got data, Ok(false) = read timed out.
    fn fill(&mut self) -> std::io::Result<bool> {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.windows(2).position(|window| window == b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf.drain(..pos + 2);
        Some(line)
    }

    fn take_bytes(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.buf.len() < n {
            return None;
        }
        Some(self.buf.drain(..n).collect())
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)
    }
}

fn serve(stream: TcpStream, shared: &Shared, config: &MockConfig) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(25)));
    let mut conn = ServerConn {
        stream,
        buf: Vec::new(),
    };

    let mut info = serde_json::json!({
        "server_id": "mock",
        "headers": true,
        "max_payload": 1_048_576,
    });
    if let Some(nonce) = &config.nonce {
        info["auth_required"] = serde_json::Value::Bool(true);
        info["nonce"] = serde_json::Value::String(nonce.clone());
    }
    if conn.write_all(format!("INFO {info}\r\n").as_bytes()).is_err() {
        return;
    }
    shared.live_subs.lock().expect("lock").clear();

    loop {
        if shared.done.load(Ordering::SeqCst) {
            return;
        }
        if shared.kill.swap(false, Ordering::SeqCst) {
            let _ = conn.stream.shutdown(Shutdown::Both);
            return;
        }
        let Some(line) = conn.take_line() else {
            match conn.fill() {
                Ok(_) => continue,
                Err(_) => return,
            }
        };
        let mut tokens = line.split_ascii_whitespace();
        let Some(verb) = tokens.next() else { continue };
        let args: Vec<&str> = tokens.collect();
        match verb {
            "CONNECT" => {
                if let Some((_, json)) = line.split_once(' ') {
                    *shared.last_connect.lock().expect("lock") = Some(json.to_string());
                }
                if config.verbose && conn.write_all(b"+OK\r\n").is_err() {
                    return;
                }
            }
            "PING" => {
                shared.pings.fetch_add(1, Ordering::SeqCst);
                if conn.write_all(b"PONG\r\n").is_err() {
                    return;
                }
            }
            "PONG" => {}
            "SUB" => {
                let (subject_name, sid) = match args.as_slice() {
                    [subject_name, sid] => (*subject_name, *sid),
                    [subject_name, _group, sid] => (*subject_name, *sid),
                    _ => continue,
                };
                let Ok(sid) = sid.parse::<u64>() else { continue };
                shared
                    .live_subs
                    .lock()
                    .expect("lock")
                    .push((sid, subject_name.to_string()));
                shared
                    .sub_history
                    .lock()
                    .expect("lock")
                    .push((sid, subject_name.to_string()));
                if config.verbose && conn.write_all(b"+OK\r\n").is_err() {
                    return;
                }
            }
            "UNSUB" => {
                if let Some(Ok(sid)) = args.first().map(|sid| sid.parse::<u64>()) {
                    shared
                        .live_subs
                        .lock()
                        .expect("lock")
                        .retain(|(live, _)| *live != sid);
                }
            }
            "PUB" | "HPUB" => {
                let Some(frame) = parse_pub(verb, &args) else { continue };
                let (mut frame, total) = frame;
                let body = loop {
                    if let Some(bytes) = conn.take_bytes(total + 2) {
                        break bytes;
                    }
                    if shared.done.load(Ordering::SeqCst) {
                        return;
                    }
                    match conn.fill() {
                        Ok(_) => {}
                        Err(_) => return,
                    }
                };
                frame.raw = body[..total].to_vec();
                shared.pubs.lock().expect("lock").push(frame.clone());
                if !route(&mut conn, shared, config, &frame) {
                    return;
                }
                if config.verbose && conn.write_all(b"+OK\r\n").is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

// Returns the frame minus its body plus the declared total length.
fn parse_pub(verb: &str, args: &[&str]) -> Option<(PubFrame, usize)> {
    let (subject_name, reply, hlen_token, total) = match (verb, args) {
        ("PUB", [subject_name, total]) => (*subject_name, None, None, *total),
        ("PUB", [subject_name, reply, total]) => (*subject_name, Some(*reply), None, *total),
        ("HPUB", [subject_name, hlen, total]) => (*subject_name, None, Some(*hlen), *total),
        ("HPUB", [subject_name, reply, hlen, total]) => {
            (*subject_name, Some(*reply), Some(*hlen), *total)
        }
        _ => return None,
    };
    let hlen: usize = match hlen_token {
        Some(text) => text.parse().ok()?,
        None => 0,
    };
    let total: usize = total.parse().ok()?;
    Some((
        PubFrame {
            subject: subject_name.to_string(),
            reply: reply.map(str::to_string),
            hlen,
            raw: Vec::new(),
        },
        total,
    ))
}

fn route(conn: &mut ServerConn, shared: &Shared, config: &MockConfig, frame: &PubFrame) -> bool {
    if let Some(reply_subject) = &frame.reply {
        if let Some((_, responder)) = config
            .responders
            .iter()
            .find(|(pattern, _)| subject::matches(pattern, &frame.subject))
        {
            for reply in responder(frame) {
                if let Some(raw) = &reply.raw {
                    if conn.write_all(raw).is_err() {
                        return false;
                    }
                    continue;
                }
                if !send_to_subscribers(conn, shared, reply_subject, reply.reply.as_deref(), {
                    let mut raw = reply
                        .header_block
                        .as_deref()
                        .unwrap_or_default()
                        .as_bytes()
                        .to_vec();
                    let hlen = raw.len();
                    raw.extend_from_slice(&reply.body);
                    (hlen, raw)
                }) {
                    return false;
                }
            }
            return true;
        }
    }
    send_to_subscribers(
        conn,
        shared,
        &frame.subject,
        frame.reply.as_deref(),
        (frame.hlen, frame.raw.clone()),
    )
}

fn send_to_subscribers(
    conn: &mut ServerConn,
    shared: &Shared,
    subject_name: &str,
    reply: Option<&str>,
    (hlen, raw): (usize, Vec<u8>),
) -> bool {
    let matching: Vec<u64> = shared
        .live_subs
        .lock()
        .expect("lock")
        .iter()
        .filter(|(_, pattern)| subject::matches(pattern, subject_name))
        .map(|(sid, _)| *sid)
        .collect();
    for sid in matching {
        let mut head = String::new();
        let reply_token = reply.map(|r| format!("{r} ")).unwrap_or_default();
        if hlen > 0 {
            head.push_str(&format!(
                "HMSG {subject_name} {sid} {reply_token}{hlen} {}\r\n",
                raw.len()
            ));
        } else {
            head.push_str(&format!("MSG {subject_name} {sid} {reply_token}{}\r\n", raw.len()));
        }
        if conn.write_all(head.as_bytes()).is_err()
            || conn.write_all(&raw).is_err()
            || conn.write_all(b"\r\n").is_err()
        {
            return false;
        }
    }
    true
}
