// Subject-level API: publish/subscribe/request multiplexing over one
// connection, driven by the cooperative `process` loop.
use std::collections::{HashMap, VecDeque};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tether_wire::{subject, ClientOp, Message, Payload};
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::ClientOptions;
use crate::conn::{Connection, SubEntry};
use crate::queue::Queue;
use crate::{Error, Result};

/// Value returned by a subscription handler to answer the message.
pub enum Reply {
    /// Published to the message's reply subject.
    Payload(Payload),
    /// Written to the broker as-is, e.g. a rendered acknowledgement frame.
    Frame(ClientOp),
}

pub type Handler = Box<dyn FnMut(&Message) -> Result<Option<Reply>>>;
type RequestCallback = Box<dyn FnOnce(Message)>;

enum SubKind {
    Handler(Handler),
    Buffer(VecDeque<Message>),
}

struct Sub {
    kind: SubKind,
    /// Deliveries left before the broker-side auto-unsubscribe fires.
    remaining: Option<u64>,
    /// Unsubscribed, but buffered messages are preserved until drained.
    closed: bool,
}

/// Blocking broker client. Owns the connection, the sid-keyed subscription
/// arena, and the shared request inbox. All progress is driven by the
/// application calling [`Client::process`] directly or through the
/// fetch/dispatch wrappers.
pub struct Client {
    conn: Connection,
    subs: HashMap<u64, Sub>,
    next_sid: u64,
    next_rid: u64,
    /// Random per-client token isolating inbox and pull subjects.
    token: String,
    inbox_prefix: String,
    inbox_sid: Option<u64>,
    replies: HashMap<u64, RequestCallback>,
}

impl Client {
    /// Dial the configured broker and complete the handshake.
    pub fn connect(opts: ClientOptions) -> Result<Self> {
        let token = Uuid::new_v4().simple().to_string();
        let inbox_prefix = format!("{}.{}", opts.inbox_prefix, token);
        let mut conn = Connection::new(opts);
        conn.connect()?;
        Ok(Self {
            conn,
            subs: HashMap::new(),
            next_sid: 1,
            next_rid: 1,
            token,
            inbox_prefix,
            inbox_sid: None,
            replies: HashMap::new(),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        self.conn.options()
    }

    pub fn server_info(&self) -> Option<&tether_wire::ServerInfo> {
        self.conn.server_info()
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    fn default_timeout(&self) -> Duration {
        self.conn.options().timeout
    }

    /// Fire-and-forget publish. No acknowledgement is awaited.
    pub fn publish(&mut self, subject_name: &str, payload: impl Into<Payload>) -> Result<()> {
        subject::ensure_publish(subject_name)?;
        self.conn.send(&ClientOp::Pub {
            subject: subject_name.to_string(),
            reply: None,
            payload: payload.into(),
        })
    }

    pub fn publish_with_reply(
        &mut self,
        subject_name: &str,
        reply: &str,
        payload: impl Into<Payload>,
    ) -> Result<()> {
        subject::ensure_publish(subject_name)?;
        self.conn.send(&ClientOp::Pub {
            subject: subject_name.to_string(),
            reply: Some(reply.to_string()),
            payload: payload.into(),
        })
    }

    pub(crate) fn send_op(&mut self, op: &ClientOp) -> Result<()> {
        self.conn.send(op)
    }

    /// Install a handler and subscribe. The sid is unique per connection
    /// and re-issued verbatim on reconnect.
    pub fn subscribe<F>(&mut self, subject_name: &str, handler: F) -> Result<u64>
    where
        F: FnMut(&Message) -> Result<Option<Reply>> + 'static,
    {
        self.subscribe_inner(subject_name, None, SubKind::Handler(Box::new(handler)))
    }

    /// Queue-group variant: the broker load-balances one copy of each
    /// message among subscribers sharing the group label.
    pub fn subscribe_with_group<F>(
        &mut self,
        subject_name: &str,
        queue_group: &str,
        handler: F,
    ) -> Result<u64>
    where
        F: FnMut(&Message) -> Result<Option<Reply>> + 'static,
    {
        self.subscribe_inner(
            subject_name,
            Some(queue_group),
            SubKind::Handler(Box::new(handler)),
        )
    }

    /// Handler-less subscription: messages accumulate until fetched
    /// through the returned [`Queue`].
    pub fn subscribe_buffered(&mut self, subject_name: &str) -> Result<Queue> {
        let sid = self.subscribe_inner(subject_name, None, SubKind::Buffer(VecDeque::new()))?;
        Ok(Queue::new(sid, self.default_timeout()))
    }

    pub fn subscribe_buffered_with_group(
        &mut self,
        subject_name: &str,
        queue_group: &str,
    ) -> Result<Queue> {
        let sid = self.subscribe_inner(
            subject_name,
            Some(queue_group),
            SubKind::Buffer(VecDeque::new()),
        )?;
        Ok(Queue::new(sid, self.default_timeout()))
    }

    fn subscribe_inner(
        &mut self,
        subject_name: &str,
        queue_group: Option<&str>,
        kind: SubKind,
    ) -> Result<u64> {
        subject::ensure(subject_name)?;
        let sid = self.next_sid;
        self.next_sid += 1;
        self.conn.send(&ClientOp::Sub {
            subject: subject_name.to_string(),
            queue_group: queue_group.map(str::to_string),
            sid,
        })?;
        self.conn.register_sub(SubEntry {
            subject: subject_name.to_string(),
            queue_group: queue_group.map(str::to_string),
            sid,
        });
        self.subs.insert(
            sid,
            Sub {
                kind,
                remaining: None,
                closed: false,
            },
        );
        Ok(sid)
    }

    /// Remove the subscription. Messages already buffered for a queue
    /// subscription stay fetchable until drained.
    pub fn unsubscribe(&mut self, sid: u64) -> Result<()> {
        if !self.subs.contains_key(&sid) {
            return Err(Error::UnknownSubscription(sid));
        }
        self.conn.send(&ClientOp::Unsub {
            sid,
            max_msgs: None,
        })?;
        self.conn.deregister_sub(sid);
        let gone = match self.subs.get_mut(&sid) {
            Some(sub) => match &mut sub.kind {
                SubKind::Buffer(buffer) if !buffer.is_empty() => {
                    sub.closed = true;
                    false
                }
                _ => true,
            },
            None => false,
        };
        if gone {
            self.subs.remove(&sid);
        }
        Ok(())
    }

    /// Ask the broker to drop the subscription after `max_msgs` further
    /// deliveries; the handler table follows suit as they arrive.
    pub fn unsubscribe_after(&mut self, sid: u64, max_msgs: u64) -> Result<()> {
        if max_msgs == 0 {
            return self.unsubscribe(sid);
        }
        let Some(sub) = self.subs.get_mut(&sid) else {
            return Err(Error::UnknownSubscription(sid));
        };
        sub.remaining = Some(max_msgs);
        self.conn.send(&ClientOp::Unsub {
            sid,
            max_msgs: Some(max_msgs),
        })
    }

    /// Publish with a fresh single-use reply subject under the shared
    /// inbox and register a one-shot callback for the response.
    pub fn request<F>(
        &mut self,
        subject_name: &str,
        payload: impl Into<Payload>,
        callback: F,
    ) -> Result<u64>
    where
        F: FnOnce(Message) + 'static,
    {
        self.ensure_inbox()?;
        let rid = self.next_rid;
        self.next_rid += 1;
        let reply = format!("{}.{rid}", self.inbox_prefix);
        self.publish_with_reply(subject_name, &reply, payload)?;
        self.replies.insert(rid, Box::new(callback));
        Ok(rid)
    }

    /// Drop a registered request callback, e.g. after a timeout.
    pub fn cancel_request(&mut self, rid: u64) {
        self.replies.remove(&rid);
    }

    /// Synchronous request/reply: blocks in [`Client::process`] until the
    /// response arrives or the deadline expires.
    pub fn dispatch(
        &mut self,
        subject_name: &str,
        payload: impl Into<Payload>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let slot: Rc<RefCell<Option<Message>>> = Rc::default();
        let writer = Rc::clone(&slot);
        let rid = self.request(subject_name, payload, move |msg| {
            *writer.borrow_mut() = Some(msg);
        })?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = slot.borrow_mut().take() {
                return Ok(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                self.cancel_request(rid);
                return Err(Error::Timeout(timeout));
            }
            self.process(deadline - now)?;
        }
    }

    /// Read frames for up to `timeout`, dispatching each message to the
    /// handler registered under its sid. Returns once the deadline expires
    /// or progress was made and the socket has nothing more buffered; the
    /// result says whether any message was dispatched.
    pub fn process(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut progressed = false;
        loop {
            let budget = if progressed {
                // Drain whatever is already decoded, then stop.
                Duration::ZERO
            } else {
                deadline.saturating_duration_since(Instant::now())
            };
            match self.conn.get_message(budget)? {
                Some(msg) => {
                    self.dispatch_message(msg)?;
                    progressed = true;
                }
                None => return Ok(progressed),
            }
        }
    }

    /// PING/PONG barrier: once this returns, the broker has seen every
    /// previously written frame.
    pub fn flush(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        if self.conn.ping(timeout)? {
            Ok(())
        } else {
            Err(Error::Timeout(timeout))
        }
    }

    fn ensure_inbox(&mut self) -> Result<()> {
        if self.inbox_sid.is_some() {
            return Ok(());
        }
        let sid = self.next_sid;
        self.next_sid += 1;
        let subject_name = format!("{}.>", self.inbox_prefix);
        self.conn.send(&ClientOp::Sub {
            subject: subject_name.clone(),
            queue_group: None,
            sid,
        })?;
        self.conn.register_sub(SubEntry {
            subject: subject_name,
            queue_group: None,
            sid,
        });
        self.inbox_sid = Some(sid);
        Ok(())
    }

    /// Fresh subject outside the inbox namespace, for pull deliveries.
    pub(crate) fn unique_subject(&mut self, prefix: &str) -> String {
        let serial = self.next_rid;
        self.next_rid += 1;
        format!("{prefix}.{}.{serial}", self.token)
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if self.inbox_sid == Some(msg.sid) {
            let rid = msg
                .subject
                .rsplit('.')
                .next()
                .and_then(|token| token.parse::<u64>().ok());
            match rid.and_then(|rid| self.replies.remove(&rid)) {
                Some(callback) => callback(msg),
                None => debug!(subject = %msg.subject, "dropping unmatched inbox reply"),
            }
            return Ok(());
        }

        let sid = msg.sid;
        let reply_to = msg.reply.clone();
        let mut reply = None;
        let mut remove = false;
        match self.subs.get_mut(&sid) {
            None => {
                debug!(sid, subject = %msg.subject, "message for unknown sid");
                return Ok(());
            }
            Some(sub) => {
                if let Some(remaining) = &mut sub.remaining {
                    *remaining = remaining.saturating_sub(1);
                    remove = *remaining == 0;
                }
                match &mut sub.kind {
                    SubKind::Buffer(buffer) => {
                        buffer.push_back(msg);
                        metrics::counter!("tether_client_queue_enqueued_total").increment(1);
                    }
                    SubKind::Handler(handler) => match handler(&msg) {
                        Ok(value) => reply = value,
                        // Handler failures are isolated per message; the
                        // message stays unacked and ack-wait semantics
                        // apply.
                        Err(err) => {
                            error!(subject = %msg.subject, error = %err, "handler failed")
                        }
                    },
                }
            }
        }
        if remove {
            self.subs.remove(&sid);
            self.conn.deregister_sub(sid);
        }
        match reply {
            None => Ok(()),
            Some(Reply::Frame(op)) => self.conn.send(&op),
            Some(Reply::Payload(payload)) => {
                let Some(reply_to) = reply_to else {
                    return Err(Error::NoReplySubject);
                };
                self.conn.send(&ClientOp::Pub {
                    subject: reply_to,
                    reply: None,
                    payload,
                })
            }
        }
    }

    /// Pop one buffered message for a queue subscription.
    pub(crate) fn take_buffered(&mut self, sid: u64) -> Result<Option<Message>> {
        let mut drained = false;
        let taken = match self.subs.get_mut(&sid) {
            Some(Sub {
                kind: SubKind::Buffer(buffer),
                closed,
                ..
            }) => {
                let msg = buffer.pop_front();
                if msg.is_some() {
                    metrics::counter!("tether_client_queue_dequeued_total").increment(1);
                }
                drained = *closed && buffer.is_empty();
                msg
            }
            Some(_) => return Err(Error::UnknownSubscription(sid)),
            None => None,
        };
        if drained {
            self.subs.remove(&sid);
        }
        Ok(taken)
    }
}
