// Control-line framing: outbound `ClientOp` encode, inbound `ServerOp`
// incremental decode.
use bytes::{Buf, BufMut, BytesMut};

use crate::headers::HeaderMap;
use crate::info::{ConnectInfo, ServerInfo};
use crate::payload::Payload;
use crate::{Error, Result};

/// Guard against a peer that never terminates its control line.
pub const MAX_CONTROL_LINE: usize = 64 * 1024;

/// Inbound application message (`MSG` or `HMSG`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub payload: Payload,
}

/// Operations written by the client.
#[derive(Debug, Clone)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Payload,
    },
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max_msgs: Option<u64>,
    },
    Ping,
    Pong,
}

/// Operations read from the server.
#[derive(Debug, Clone)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg(Message),
    Ping,
    Pong,
    Ok,
    Err(String),
}

impl ClientOp {
    /// Append the serialised frame. A payload with headers is written as
    /// `HPUB`, otherwise `PUB`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Connect(info) => {
                buf.put_slice(b"CONNECT ");
                buf.put_slice(&serde_json::to_vec(info)?);
                buf.put_slice(b"\r\n");
            }
            Self::Pub {
                subject,
                reply,
                payload,
            } => {
                if payload.headers.is_empty() {
                    buf.put_slice(b"PUB ");
                    buf.put_slice(subject.as_bytes());
                    buf.put_u8(b' ');
                    if let Some(reply) = reply {
                        buf.put_slice(reply.as_bytes());
                        buf.put_u8(b' ');
                    }
                    buf.put_slice(payload.body.len().to_string().as_bytes());
                    buf.put_slice(b"\r\n");
                    buf.put_slice(&payload.body);
                    buf.put_slice(b"\r\n");
                } else {
                    let mut block = BytesMut::new();
                    payload.headers.encode(&mut block);
                    let total = block.len() + payload.body.len();
                    buf.put_slice(b"HPUB ");
                    buf.put_slice(subject.as_bytes());
                    buf.put_u8(b' ');
                    if let Some(reply) = reply {
                        buf.put_slice(reply.as_bytes());
                        buf.put_u8(b' ');
                    }
                    buf.put_slice(block.len().to_string().as_bytes());
                    buf.put_u8(b' ');
                    buf.put_slice(total.to_string().as_bytes());
                    buf.put_slice(b"\r\n");
                    buf.put_slice(&block);
                    buf.put_slice(&payload.body);
                    buf.put_slice(b"\r\n");
                }
            }
            Self::Sub {
                subject,
                queue_group,
                sid,
            } => {
                buf.put_slice(b"SUB ");
                buf.put_slice(subject.as_bytes());
                buf.put_u8(b' ');
                if let Some(group) = queue_group {
                    buf.put_slice(group.as_bytes());
                    buf.put_u8(b' ');
                }
                buf.put_slice(sid.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Unsub { sid, max_msgs } => {
                buf.put_slice(b"UNSUB ");
                buf.put_slice(sid.to_string().as_bytes());
                if let Some(max) = max_msgs {
                    buf.put_u8(b' ');
                    buf.put_slice(max.to_string().as_bytes());
                }
                buf.put_slice(b"\r\n");
            }
            Self::Ping => buf.put_slice(b"PING\r\n"),
            Self::Pong => buf.put_slice(b"PONG\r\n"),
        }
        Ok(())
    }
}

impl ServerOp {
    /// Decode at most one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when the buffer holds
    /// only part of a frame; the caller reads more bytes and retries.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ServerOp>> {
        let Some(line_end) = find_crlf(buf) else {
            if buf.len() > MAX_CONTROL_LINE {
                return Err(Error::BadControlLine("unterminated control line".to_string()));
            }
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[..line_end])
            .map_err(|_| Error::BadControlLine("non-utf8 control line".to_string()))?;

        let mut tokens = line.split_ascii_whitespace();
        let op = tokens.next().unwrap_or("").to_ascii_uppercase();
        match op.as_str() {
            "PING" => {
                buf.advance(line_end + 2);
                Ok(Some(Self::Ping))
            }
            "PONG" => {
                buf.advance(line_end + 2);
                Ok(Some(Self::Pong))
            }
            "+OK" => {
                buf.advance(line_end + 2);
                Ok(Some(Self::Ok))
            }
            "-ERR" => {
                let text = line[4..].trim().trim_matches('\'').to_string();
                buf.advance(line_end + 2);
                Ok(Some(Self::Err(text)))
            }
            "INFO" => {
                let json = line.split_once([' ', '\t']).map(|(_, rest)| rest).unwrap_or("");
                let info: ServerInfo = serde_json::from_str(json.trim())?;
                buf.advance(line_end + 2);
                Ok(Some(Self::Info(info)))
            }
            "MSG" | "HMSG" => Self::decode_data(buf, line_end, &op),
            "" => Err(Error::BadControlLine(line.to_string())),
            _ => Err(Error::UnknownOp(op)),
        }
    }

    fn decode_data(buf: &mut BytesMut, line_end: usize, op: &str) -> Result<Option<ServerOp>> {
        let line = std::str::from_utf8(&buf[..line_end]).expect("validated utf8");
        let args: Vec<&str> = line.split_ascii_whitespace().skip(1).collect();

        // Four tokens on HMSG (three on MSG) means no reply subject; the
        // extra token, when present, sits between sid and the lengths.
        let (subject, sid_token, reply, hlen_token, total_token) = match (op, args.len()) {
            ("MSG", 3) => (args[0], args[1], None, None, args[2]),
            ("MSG", 4) => (args[0], args[1], Some(args[2]), None, args[3]),
            ("HMSG", 4) => (args[0], args[1], None, Some(args[2]), args[3]),
            ("HMSG", 5) => (args[0], args[1], Some(args[2]), Some(args[3]), args[4]),
            _ => return Err(Error::BadControlLine(line.to_string())),
        };
        let sid: u64 = sid_token.parse().map_err(|_| Error::BadField {
            field: "sid",
            value: sid_token.to_string(),
        })?;
        let total: usize = total_token.parse().map_err(|_| Error::BadField {
            field: "length",
            value: total_token.to_string(),
        })?;
        let hlen: usize = match hlen_token {
            Some(token) => token.parse().map_err(|_| Error::BadField {
                field: "header length",
                value: token.to_string(),
            })?,
            None => 0,
        };
        if hlen > total {
            return Err(Error::HeaderOverrun { hlen, total });
        }

        if buf.len() < line_end + 2 + total + 2 {
            return Ok(None);
        }
        let subject = subject.to_string();
        let reply = reply.map(str::to_string);

        buf.advance(line_end + 2);
        let mut body = buf.split_to(total);
        let terminator = buf.split_to(2);
        if &terminator[..] != b"\r\n" {
            return Err(Error::UnterminatedPayload);
        }
        let headers = if hlen > 0 {
            let block = body.split_to(hlen);
            HeaderMap::decode(&block)?
        } else {
            HeaderMap::new()
        };

        Ok(Some(Self::Msg(Message {
            subject,
            sid,
            reply,
            payload: Payload::with_headers(body.freeze(), headers),
        })))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(input: &[u8]) -> ServerOp {
        let mut buf = BytesMut::from(input);
        let op = ServerOp::decode(&mut buf).expect("decode").expect("complete frame");
        assert!(buf.is_empty(), "frame fully consumed");
        op
    }

    #[test]
    fn decodes_msg_without_reply() {
        let op = decode_one(b"MSG orders.new 7 5\r\nhello\r\n");
        let ServerOp::Msg(msg) = op else { panic!("expected msg") };
        assert_eq!(msg.subject, "orders.new");
        assert_eq!(msg.sid, 7);
        assert_eq!(msg.reply, None);
        assert_eq!(msg.payload.body.as_ref(), b"hello");
        assert_eq!(msg.payload.body.len(), 5);
    }

    #[test]
    fn decodes_msg_with_reply() {
        let op = decode_one(b"MSG orders.new 7 _INBOX.1.9 5\r\nhello\r\n");
        let ServerOp::Msg(msg) = op else { panic!("expected msg") };
        assert_eq!(msg.reply.as_deref(), Some("_INBOX.1.9"));
    }

    #[test]
    fn decodes_hmsg_with_status_block() {
        // 26-byte header block, 4-byte body.
        let op = decode_one(b"HMSG sub 1 26 30\r\nNATS/1.0 404 Not Found\r\n\r\nbody\r\n");
        let ServerOp::Msg(msg) = op else { panic!("expected msg") };
        assert_eq!(msg.payload.status_code(), Some(404));
        assert_eq!(msg.payload.status_message(), Some("Not Found"));
        assert_eq!(msg.payload.body.as_ref(), b"body");
    }

    #[test]
    fn decodes_hmsg_with_reply_and_headers() {
        let frame = b"HMSG sub 3 reply.to 22 25\r\nNATS/1.0\r\nFoo: bar\r\n\r\nabc\r\n";
        let ServerOp::Msg(msg) = decode_one(frame) else { panic!("expected msg") };
        assert_eq!(msg.reply.as_deref(), Some("reply.to"));
        assert_eq!(msg.payload.headers.get("Foo"), Some("bar"));
        assert_eq!(msg.payload.body.as_ref(), b"abc");
    }

    #[test]
    fn partial_frame_leaves_buffer_intact() {
        let mut buf = BytesMut::from(&b"MSG orders.new 7 5\r\nhel"[..]);
        assert!(ServerOp::decode(&mut buf).expect("decode").is_none());
        assert_eq!(buf.len(), 23);

        buf.extend_from_slice(b"lo\r\n");
        let op = ServerOp::decode(&mut buf).expect("decode").expect("frame");
        assert!(matches!(op, ServerOp::Msg(_)));
    }

    #[test]
    fn partial_control_line_yields_none() {
        let mut buf = BytesMut::from(&b"PIN"[..]);
        assert!(ServerOp::decode(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn decodes_control_frames() {
        assert!(matches!(decode_one(b"PING\r\n"), ServerOp::Ping));
        assert!(matches!(decode_one(b"PONG\r\n"), ServerOp::Pong));
        assert!(matches!(decode_one(b"+OK\r\n"), ServerOp::Ok));
    }

    #[test]
    fn decodes_err_with_quoted_text() {
        let ServerOp::Err(text) = decode_one(b"-ERR 'Authorization Violation'\r\n") else {
            panic!("expected err");
        };
        assert_eq!(text, "Authorization Violation");
    }

    #[test]
    fn decodes_info() {
        let ServerOp::Info(info) =
            decode_one(b"INFO {\"server_id\":\"S1\",\"nonce\":\"xyz\"}\r\n")
        else {
            panic!("expected info");
        };
        assert_eq!(info.server_id, "S1");
        assert_eq!(info.nonce.as_deref(), Some("xyz"));
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = BytesMut::from(&b"MSG a 1 2\r\nhi\r\nPONG\r\n"[..]);
        assert!(matches!(
            ServerOp::decode(&mut buf).expect("decode"),
            Some(ServerOp::Msg(_))
        ));
        assert!(matches!(
            ServerOp::decode(&mut buf).expect("decode"),
            Some(ServerOp::Pong)
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unknown_op() {
        let mut buf = BytesMut::from(&b"WAT 1 2 3\r\n"[..]);
        assert!(matches!(
            ServerOp::decode(&mut buf),
            Err(Error::UnknownOp(_))
        ));
    }

    #[test]
    fn rejects_header_length_past_total() {
        let mut buf = BytesMut::from(&b"HMSG sub 1 30 26\r\n"[..]);
        assert!(matches!(
            ServerOp::decode(&mut buf),
            Err(Error::HeaderOverrun { hlen: 30, total: 26 })
        ));
    }

    #[test]
    fn encodes_pub() {
        let op = ClientOp::Pub {
            subject: "orders.new".to_string(),
            reply: None,
            payload: Payload::from("hello"),
        };
        let mut buf = BytesMut::new();
        op.encode(&mut buf).expect("encode");
        assert_eq!(&buf[..], b"PUB orders.new 5\r\nhello\r\n");
    }

    #[test]
    fn encodes_pub_with_reply() {
        let op = ClientOp::Pub {
            subject: "a".to_string(),
            reply: Some("r".to_string()),
            payload: Payload::from("x"),
        };
        let mut buf = BytesMut::new();
        op.encode(&mut buf).expect("encode");
        assert_eq!(&buf[..], b"PUB a r 1\r\nx\r\n");
    }

    #[test]
    fn encodes_hpub_when_headers_present() {
        let mut payload = Payload::from("hi");
        payload.headers.insert("Nats-Msg-Id", "7");
        let op = ClientOp::Pub {
            subject: "a".to_string(),
            reply: None,
            payload,
        };
        let mut buf = BytesMut::new();
        op.encode(&mut buf).expect("encode");
        // NATS/1.0\r\n + Nats-Msg-Id: 7\r\n + \r\n = 28 bytes of headers.
        assert_eq!(&buf[..], b"HPUB a 28 30\r\nNATS/1.0\r\nNats-Msg-Id: 7\r\n\r\nhi\r\n");
    }

    #[test]
    fn encodes_sub_and_unsub() {
        let mut buf = BytesMut::new();
        ClientOp::Sub {
            subject: "orders.*".to_string(),
            queue_group: Some("workers".to_string()),
            sid: 4,
        }
        .encode(&mut buf)
        .expect("encode");
        ClientOp::Unsub {
            sid: 4,
            max_msgs: Some(10),
        }
        .encode(&mut buf)
        .expect("encode");
        assert_eq!(&buf[..], b"SUB orders.* workers 4\r\nUNSUB 4 10\r\n");
    }

    #[test]
    fn hpub_round_trips_through_hmsg() {
        let mut payload = Payload::from("payload-bytes");
        payload.headers.insert("Key", "value");
        let op = ClientOp::Pub {
            subject: "subj".to_string(),
            reply: None,
            payload: payload.clone(),
        };
        let mut buf = BytesMut::new();
        op.encode(&mut buf).expect("encode");

        // Rewrite the control line as the matching inbound HMSG.
        let text = String::from_utf8(buf.to_vec()).expect("utf8");
        let inbound = text.replacen("HPUB subj", "HMSG subj 9", 1);
        let mut inbound = BytesMut::from(inbound.as_bytes());
        let ServerOp::Msg(msg) = ServerOp::decode(&mut inbound).expect("decode").expect("frame")
        else {
            panic!("expected msg");
        };
        assert_eq!(msg.sid, 9);
        assert_eq!(msg.payload, payload);
    }
}
