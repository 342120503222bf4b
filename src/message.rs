//! A single delivered message.

use std::fmt;

/// A message received from the server.
///
/// Payloads are opaque bytes; the client never inspects them. `reply` is set
/// when the publisher asked for a response.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,
    /// Reply subject, if the publisher expects a response.
    pub reply: Option<String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Subscription id this message was routed to.
    pub(crate) sid: u64,
}

impl Message {
    pub(crate) fn new(subject: String, reply: Option<String>, payload: Vec<u8>, sid: u64) -> Self {
        Self {
            subject,
            reply,
            payload,
            sid,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// `true` when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("sid", &self.sid)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
