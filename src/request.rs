//! Request/reply multiplexing over a shared inbox.
//!
//! New-style requests share one wildcard subscription per connection:
//! `<inbox-prefix>.*`. Each request takes a fingerprint token, publishes with
//! reply `<inbox-prefix>.<fingerprint>`, and parks on a oneshot channel. The
//! inbox subscription's handler looks the fingerprint (the final subject
//! token) up in the waiter table and completes the matching oneshot.
//!
//! Fingerprint tokens are recycled through a small pool so a request-heavy
//! connection reuses a handful of short tokens instead of growing the
//! subject space forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::oneshot;

use crate::message::Message;
use crate::options::MessageHandler;

/// Recycled fingerprint tokens kept around, per connection.
const RESP_POOL_MAX: usize = 10;
/// Length of the random unique part of an inbox subject.
const INBOX_TOKEN_LEN: usize = 22;

/// Builds a fresh unique inbox subject, usable as a reply address.
pub fn new_inbox() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INBOX_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("_INBOX.{token}")
}

#[derive(Default)]
struct MuxState {
    waiters: HashMap<String, oneshot::Sender<Message>>,
    next_fingerprint: u64,
    free_tokens: Vec<String>,
}

/// Per-connection request multiplexer. Lazily created on the first
/// new-style request.
pub(crate) struct RequestMux {
    /// `_INBOX.<unique>`; the shared subscription listens on `<prefix>.*`.
    prefix: String,
    state: Arc<Mutex<MuxState>>,
}

impl RequestMux {
    pub(crate) fn new(prefix: String) -> Self {
        Self {
            prefix,
            state: Arc::default(),
        }
    }

    /// Subject the shared subscription must be created on.
    pub(crate) fn wildcard_subject(&self) -> String {
        format!("{}.*", self.prefix)
    }

    /// Claims a fingerprint and registers its waiter. Returns the full reply
    /// subject to publish with and the channel the response arrives on.
    pub(crate) fn register(&self) -> (String, String, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let token = match state.free_tokens.pop() {
            Some(token) => token,
            None => {
                state.next_fingerprint += 1;
                state.next_fingerprint.to_string()
            }
        };
        state.waiters.insert(token.clone(), tx);
        let reply = format!("{}.{}", self.prefix, token);
        (token, reply, rx)
    }

    /// Returns a fingerprint after the request completed (or timed out),
    /// dropping any still-registered waiter and recycling the token.
    pub(crate) fn release(&self, token: &str) {
        let mut state = self.state.lock().unwrap();
        state.waiters.remove(token);
        if state.free_tokens.len() < RESP_POOL_MAX {
            state.free_tokens.push(token.to_string());
        }
    }

    /// Fails every outstanding request; their receivers observe a closed
    /// channel. Used on connection close and drain.
    pub(crate) fn fail_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiters.clear();
    }

    /// Handler for the shared inbox subscription: routes a response to the
    /// waiter matching the final subject token.
    pub(crate) fn make_handler(&self) -> MessageHandler {
        let state = self.state.clone();
        Arc::new(move |msg: Option<Message>| {
            let Some(msg) = msg else { return };
            let Some(fingerprint) = msg.subject.rsplit('.').next() else {
                return;
            };
            let waiter = state.lock().unwrap().waiters.remove(fingerprint);
            if let Some(tx) = waiter {
                // The requester may have timed out already; that's fine.
                let _ = tx.send(msg);
            }
        })
    }
}
