// Connection lifecycle: dial, TLS upgrade, INFO/CONNECT handshake, chunked
// writes, control-frame handling, keep-alive, and reconnect with
// subscription replay.
use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tether_wire::{ClientOp, ConnectInfo, Message, ServerInfo, ServerOp};
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::ClientOptions;
use crate::tls;
use crate::{Error, Result};

const READ_CHUNK: usize = 16 * 1024;
/// Upper bound on a single blocking read so keep-alive checks stay timely.
const READ_SLICE: Duration = Duration::from_millis(250);
/// Missed-PONG tolerance, in ping intervals, before the socket is declared
/// dead.
const PING_GRACE: u32 = 3;

enum Socket {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Socket {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// Subscription replayed to the broker after every reconnect.
#[derive(Debug, Clone)]
pub(crate) struct SubEntry {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) sid: u64,
}

/// One TCP/TLS socket plus the read tokeniser, keep-alive state, and the
/// re-subscribe registry.
pub struct Connection {
    opts: ClientOptions,
    socket: Option<Socket>,
    closed: bool,
    read_buf: BytesMut,
    pending: VecDeque<Message>,
    info: Option<ServerInfo>,
    activity_at: Instant,
    pong_at: Instant,
    ping_sent_at: Option<Instant>,
    subscriptions: Vec<SubEntry>,
}

impl Connection {
    pub fn new(opts: ClientOptions) -> Self {
        let now = Instant::now();
        Self {
            opts,
            socket: None,
            closed: false,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            pending: VecDeque::new(),
            info: None,
            activity_at: now,
            pong_at: now,
            ping_sent_at: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    /// INFO most recently advertised by the server.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.info.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Dial and handshake, replaying any registered subscriptions. A no-op
    /// when already connected.
    pub fn connect(&mut self) -> Result<()> {
        self.closed = false;
        if self.socket.is_some() {
            return Ok(());
        }
        self.establish(&self.opts.addr())?;
        self.replay_subscriptions()
    }

    /// Idempotent. Reads return nothing and writes fail until
    /// [`Connection::connect`] is called again.
    pub fn close(&mut self) {
        self.closed = true;
        self.drop_socket();
    }

    pub(crate) fn register_sub(&mut self, entry: SubEntry) {
        self.subscriptions.push(entry);
    }

    pub(crate) fn deregister_sub(&mut self, sid: u64) {
        self.subscriptions.retain(|entry| entry.sid != sid);
    }

    /// Serialise and write one frame, in chunks of at most `packet_size`
    /// bytes. A failed write reconnects and retries once when reconnect is
    /// enabled, otherwise the error surfaces.
    pub fn send(&mut self, op: &ClientOp) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.socket.is_none() {
            if !self.opts.reconnect {
                return Err(Error::Closed);
            }
            self.reconnect()?;
        }
        match self.write_op(op) {
            Ok(()) => Ok(()),
            Err(err) if err.is_reconnectable() && self.opts.reconnect => {
                warn!(error = %err, "write failed, reconnecting");
                self.reconnect()?;
                self.write_op(op)
            }
            Err(err) => Err(err),
        }
    }

    /// Read at most one application-visible message within the deadline.
    ///
    /// Control frames are consumed internally: `+OK` is dropped, `PING` is
    /// answered with `PONG`, `PONG` advances the keep-alive clock, `-ERR`
    /// surfaces as an error, and a mid-stream `INFO` replaces the cached
    /// server info. A zero timeout drains already-buffered frames only.
    pub fn get_message(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        if self.closed || self.socket.is_none() {
            if self.closed || !self.opts.reconnect {
                return Ok(None);
            }
            self.reconnect()?;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.pump(deadline) {
                Ok(found) => return Ok(found),
                Err(err) if err.is_reconnectable() && self.opts.reconnect => {
                    warn!(error = %err, "read failed, reconnecting");
                    self.reconnect()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Write `PING` and read frames until the matching `PONG` arrives or
    /// the timeout fires. Application messages seen along the way are held
    /// for the next `get_message`.
    pub fn ping(&mut self, timeout: Duration) -> Result<bool> {
        self.send(&ClientOp::Ping)?;
        // Snapshot only after the write: `send` may have reconnected, and
        // the handshake's own synchronising PONG advances `pong_at`. Only
        // a PONG read after the PING above may satisfy this call.
        let mut before = self.pong_at;
        let deadline = Instant::now() + timeout;
        loop {
            if self.pong_at > before {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            match self.pump(deadline) {
                Ok(Some(msg)) => self.pending.push_back(msg),
                Ok(None) => {}
                Err(err) if err.is_reconnectable() && self.opts.reconnect => {
                    self.reconnect()?;
                    // The old PING died with the socket; only the
                    // replacement's PONG counts.
                    self.send(&ClientOp::Ping)?;
                    before = self.pong_at;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // One read pass: keep-alive bookkeeping, then decode-or-fill until a
    // message or the deadline.
    fn pump(&mut self, deadline: Instant) -> Result<Option<Message>> {
        loop {
            self.keepalive()?;
            let slice_deadline = deadline.min(Instant::now() + READ_SLICE);
            match self.next_op(slice_deadline)? {
                Some(op) => {
                    if let Some(msg) = self.handle_op(op)? {
                        return Ok(Some(msg));
                    }
                }
                None => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }

    // Decode-or-fill loop with no control-frame semantics.
    fn next_op(&mut self, deadline: Instant) -> Result<Option<ServerOp>> {
        loop {
            if let Some(op) = self.try_decode()? {
                return Ok(Some(op));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.fill(deadline)?;
        }
    }

    fn try_decode(&mut self) -> Result<Option<ServerOp>> {
        loop {
            match ServerOp::decode(&mut self.read_buf) {
                Ok(op) => return Ok(op),
                Err(err) if self.opts.skip_invalid_messages => {
                    warn!(error = %err, "dropping invalid frame");
                    self.resync();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // Skip past the offending control line; without a terminator in sight
    // the whole buffer goes.
    fn resync(&mut self) {
        match self
            .read_buf
            .windows(2)
            .position(|window| window == b"\r\n")
        {
            Some(pos) => self.read_buf.advance(pos + 2),
            None => self.read_buf.clear(),
        }
    }

    fn handle_op(&mut self, op: ServerOp) -> Result<Option<Message>> {
        match op {
            ServerOp::Msg(msg) => Ok(Some(msg)),
            ServerOp::Ping => {
                self.write_op(&ClientOp::Pong)?;
                Ok(None)
            }
            ServerOp::Pong => {
                self.pong_at = Instant::now();
                self.ping_sent_at = None;
                Ok(None)
            }
            ServerOp::Ok => Ok(None),
            ServerOp::Info(new_info) => {
                debug!(server_id = %new_info.server_id, "server info updated");
                self.info = Some(new_info);
                Ok(None)
            }
            ServerOp::Err(text) => Err(Error::from_server_err(text)),
        }
    }

    fn keepalive(&mut self) -> Result<()> {
        if self.socket.is_none() {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(sent) = self.ping_sent_at {
            if now.duration_since(sent) > self.opts.ping_interval * PING_GRACE {
                warn!("no pong within grace period, dropping connection");
                return Err(Error::Closed);
            }
        } else if now.duration_since(self.activity_at) > self.opts.ping_interval {
            self.write_op(&ClientOp::Ping)?;
            self.ping_sent_at = Some(now);
        }
        Ok(())
    }

    // One bounded socket read into the tokeniser buffer. `Ok(false)` means
    // the slice elapsed without data.
    fn fill(&mut self, deadline: Instant) -> Result<bool> {
        let socket = self.socket.as_mut().ok_or(Error::Closed)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = remaining.min(READ_SLICE).max(Duration::from_millis(1));
        socket.tcp().set_read_timeout(Some(slice))?;
        let mut chunk = [0u8; READ_CHUNK];
        match socket.read(&mut chunk) {
            Ok(0) => Err(Error::Closed),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                self.activity_at = Instant::now();
                Ok(true)
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_op(&mut self, op: &ClientOp) -> Result<()> {
        let mut buf = BytesMut::new();
        op.encode(&mut buf)?;
        let socket = self.socket.as_mut().ok_or(Error::Closed)?;
        match self.opts.packet_size {
            Some(size) if size > 0 => {
                for chunk in buf.chunks(size) {
                    socket.write_all(chunk)?;
                }
            }
            _ => socket.write_all(&buf)?,
        }
        socket.flush()?;
        self.activity_at = Instant::now();
        Ok(())
    }

    fn drop_socket(&mut self) {
        self.socket = None;
        self.read_buf.clear();
        self.ping_sent_at = None;
    }

    // Dial, optional TLS, INFO, CONNECT, then a synchronising PING/PONG.
    fn establish(&mut self, addr: &str) -> Result<()> {
        let deadline = Instant::now() + self.opts.timeout;
        let tcp = dial(addr, self.opts.timeout)?;
        tcp.set_nodelay(true)?;
        self.read_buf.clear();
        self.ping_sent_at = None;
        self.socket = Some(if self.opts.tls_handshake_first {
            self.upgrade(tcp)?
        } else {
            Socket::Plain(tcp)
        });

        let server_info = loop {
            let Some(op) = self.next_op(deadline)? else {
                self.drop_socket();
                return Err(Error::Timeout(self.opts.timeout));
            };
            match op {
                ServerOp::Info(received) => break received,
                ServerOp::Err(text) => {
                    self.drop_socket();
                    return Err(Error::from_server_err(text));
                }
                other => {
                    self.drop_socket();
                    return Err(Error::Server(format!("expected INFO, got {other:?}")));
                }
            }
        };

        let wants_tls = server_info.tls_required || self.opts.wants_tls();
        if wants_tls && matches!(self.socket, Some(Socket::Plain(_))) {
            let Some(Socket::Plain(tcp)) = self.socket.take() else {
                unreachable!("plain socket checked above");
            };
            self.socket = Some(self.upgrade(tcp)?);
        }

        let mut connect = ConnectInfo {
            verbose: self.opts.verbose,
            pedantic: self.opts.pedantic,
            tls_required: wants_tls,
            lang: self.opts.lang.clone(),
            version: self.opts.version.clone(),
            name: self.opts.name.clone(),
            ..ConnectInfo::default()
        };
        auth::fill_connect(&self.opts, &server_info, &mut connect)?;
        self.info = Some(server_info);

        self.write_op(&ClientOp::Connect(connect))?;
        self.write_op(&ClientOp::Ping)?;

        // Wait for the synchronising PONG; verbose mode delivers the `+OK`
        // for CONNECT first.
        loop {
            let Some(op) = self.next_op(deadline)? else {
                self.drop_socket();
                return Err(Error::Timeout(self.opts.timeout));
            };
            match op {
                ServerOp::Pong => break,
                ServerOp::Ok => {}
                ServerOp::Ping => self.write_op(&ClientOp::Pong)?,
                ServerOp::Info(received) => self.info = Some(received),
                ServerOp::Msg(msg) => self.pending.push_back(msg),
                ServerOp::Err(text) => {
                    self.drop_socket();
                    return Err(Error::from_server_err(text));
                }
            }
        }
        let now = Instant::now();
        self.activity_at = now;
        self.pong_at = now;
        debug!(addr, "connected");
        Ok(())
    }

    fn upgrade(&self, tcp: TcpStream) -> Result<Socket> {
        let config = tls::client_config(&self.opts)?;
        let server_name = ServerName::try_from(self.opts.host.clone())
            .map_err(|_| Error::ServerName(self.opts.host.clone()))?;
        let tls_conn = rustls::ClientConnection::new(config, server_name)?;
        Ok(Socket::Tls(Box::new(rustls::StreamOwned::new(
            tls_conn, tcp,
        ))))
    }

    /// Tear down the socket and walk the back-off schedule across the
    /// configured address plus any server-advertised endpoints. On success
    /// every live subscription is re-issued before the call returns, so no
    /// application write can slip in front of the replay.
    pub(crate) fn reconnect(&mut self) -> Result<()> {
        self.drop_socket();
        if self.closed || !self.opts.reconnect {
            return Err(Error::Closed);
        }
        let mut candidates = vec![self.opts.addr()];
        if let Some(cached) = &self.info {
            for url in &cached.connect_urls {
                if !candidates.contains(url) {
                    candidates.push(url.clone());
                }
            }
        }
        let mut last_err = Error::Closed;
        for attempt in 0..self.opts.reconnect_attempts {
            std::thread::sleep(self.opts.delay_mode.delay_for(self.opts.delay, attempt));
            for addr in &candidates {
                match self.establish(addr) {
                    Ok(()) => {
                        self.replay_subscriptions()?;
                        info!(%addr, attempt, "reconnected");
                        return Ok(());
                    }
                    Err(err @ Error::Auth(_)) => return Err(err),
                    Err(err) => {
                        debug!(%addr, error = %err, "reconnect attempt failed");
                        self.drop_socket();
                        last_err = err;
                    }
                }
            }
        }
        Err(last_err)
    }

    fn replay_subscriptions(&mut self) -> Result<()> {
        let entries = self.subscriptions.clone();
        for entry in &entries {
            self.write_op(&ClientOp::Sub {
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
                sid: entry.sid,
            })?;
        }
        Ok(())
    }
}

fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let timeout = timeout.max(Duration::from_millis(1));
    let mut last: Option<std::io::Error> = None;
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = Some(err),
        }
    }
    Err(last
        .map(Error::Io)
        .unwrap_or_else(|| Error::Config(format!("no addresses for {addr}"))))
}
