// FIFO handle over a buffered subscription, with deadlined fetches.
use std::time::{Duration, Instant};
use tether_wire::Message;

use crate::client::Client;
use crate::Result;

/// Handle to a handler-less subscription. The client's dispatch loop
/// enqueues matching messages; `fetch` drains them one at a time. The
/// handle holds only the sid and borrows the client per call.
#[derive(Debug, Clone)]
pub struct Queue {
    sid: u64,
    /// Budget used by [`Queue::fetch_all`].
    pub timeout: Duration,
}

impl Queue {
    pub(crate) fn new(sid: u64, timeout: Duration) -> Self {
        Self { sid, timeout }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Return one message, driving the client's process loop until the
    /// deadline when the buffer is empty.
    pub fn fetch(&self, client: &mut Client, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = client.take_buffered(self.sid)? {
                return Ok(Some(msg));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            client.process(deadline - now)?;
        }
    }

    /// Return up to `limit` messages accumulated within the queue's own
    /// timeout budget. A 404/408 status message is kept in the batch as
    /// the no-messages terminator and ends the fetch early.
    pub fn fetch_all(&self, client: &mut Client, limit: Option<usize>) -> Result<Vec<Message>> {
        let deadline = Instant::now() + self.timeout;
        let mut batch = Vec::new();
        loop {
            if let Some(limit) = limit {
                if batch.len() >= limit {
                    return Ok(batch);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.fetch(client, remaining)? {
                Some(msg) => {
                    let terminator = msg.payload.is_no_messages();
                    batch.push(msg);
                    if terminator {
                        return Ok(batch);
                    }
                }
                None => return Ok(batch),
            }
        }
    }
}
