// Acknowledgement frames. Each is a `PUB` on the delivery's reply-to
// subject; the rendered text form keeps the empty reply slot.
use std::time::Duration;
use tether_wire::{ClientOp, Payload};

/// Positive acknowledgement: the broker forgets the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub subject: String,
}

/// Negative acknowledgement: the broker reschedules the message, after
/// `delay` when one is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nak {
    pub subject: String,
    pub delay: Option<Duration>,
}

/// Work-in-progress marker: resets the ack-wait timer without
/// acknowledging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub subject: String,
}

/// Terminal rejection: the broker drops the message permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub subject: String,
    pub reason: Option<String>,
}

impl Ack {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    pub fn body(&self) -> String {
        "+ACK".to_string()
    }

    pub fn render(&self) -> String {
        render_pub(&self.subject, &self.body())
    }
}

impl Nak {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            delay: None,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn body(&self) -> String {
        match self.delay {
            Some(delay) => format!("-NAK {{\"delay\":{}}}", delay.as_nanos()),
            None => "-NAK".to_string(),
        }
    }

    pub fn render(&self) -> String {
        render_pub(&self.subject, &self.body())
    }
}

impl Progress {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    pub fn body(&self) -> String {
        "+WPI".to_string()
    }

    pub fn render(&self) -> String {
        render_pub(&self.subject, &self.body())
    }
}

impl Term {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn body(&self) -> String {
        match &self.reason {
            Some(reason) => format!("+TERM {reason}"),
            None => "+TERM".to_string(),
        }
    }

    pub fn render(&self) -> String {
        render_pub(&self.subject, &self.body())
    }
}

fn render_pub(subject: &str, body: &str) -> String {
    format!("PUB {subject}  {}\r\n{body}", body.len())
}

fn into_pub(subject: String, body: String) -> ClientOp {
    ClientOp::Pub {
        subject,
        reply: None,
        payload: Payload::from(body),
    }
}

impl From<Ack> for ClientOp {
    fn from(frame: Ack) -> Self {
        let body = frame.body();
        into_pub(frame.subject, body)
    }
}

impl From<Nak> for ClientOp {
    fn from(frame: Nak) -> Self {
        let body = frame.body();
        into_pub(frame.subject, body)
    }
}

impl From<Progress> for ClientOp {
    fn from(frame: Progress) -> Self {
        let body = frame.body();
        into_pub(frame.subject, body)
    }
}

impl From<Term> for ClientOp {
    fn from(frame: Term) -> Self {
        let body = frame.body();
        into_pub(frame.subject, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn term_renders_the_documented_frame() {
        let term = Term::new("$JS.ACK.stream.consumer.1.3.18.1719992702186105579.0");
        assert_eq!(
            term.render(),
            "PUB $JS.ACK.stream.consumer.1.3.18.1719992702186105579.0  5\r\n+TERM"
        );
    }

    #[test]
    fn term_with_reason_extends_the_payload() {
        let term = Term::new("$JS.ACK.stream.consumer.1.3.18.1719992702186105579.0")
            .with_reason("invalid message");
        assert_eq!(term.body().len(), 21);
        assert!(term.render().ends_with("21\r\n+TERM invalid message"));
    }

    #[test]
    fn ack_and_progress_bodies() {
        assert_eq!(Ack::new("s").body(), "+ACK");
        assert_eq!(Progress::new("s").body(), "+WPI");
    }

    #[test]
    fn nak_with_delay_carries_nanoseconds() {
        let nak = Nak::new("s").with_delay(Duration::from_secs(5));
        assert_eq!(nak.body(), "-NAK {\"delay\":5000000000}");
        assert_eq!(Nak::new("s").body(), "-NAK");
    }

    #[test]
    fn frames_convert_into_publish_ops() {
        let op: ClientOp = Ack::new("reply.to").into();
        let mut buf = BytesMut::new();
        op.encode(&mut buf).expect("encode");
        assert_eq!(&buf[..], b"PUB reply.to 4\r\n+ACK\r\n");
    }
}
