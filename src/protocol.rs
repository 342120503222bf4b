//! Wire-level types and command encoding.
//!
//! The protocol is line-oriented, `\r\n`-terminated:
//! - server → client: `INFO {json}`, `MSG <subject> <sid> [reply] <size>`,
//!   `PING`, `PONG`, `+OK`, `-ERR '<text>'`
//! - client → server: `CONNECT {json}`, `PUB <subject> [reply] <size>`,
//!   `SUB <subject> [queue] <sid>`, `UNSUB <sid> [max]`, `PING`, `PONG`
//!
//! Encoders append directly into the caller's byte buffer so the publish hot
//! path does not allocate per message beyond buffer growth.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const PING_OP: &[u8] = b"PING\r\n";
pub(crate) const PONG_OP: &[u8] = b"PONG\r\n";

/// Client library version reported in CONNECT.
pub(crate) const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Client language reported in CONNECT.
pub(crate) const CLIENT_LANG: &str = "rust";

// ─── INFO / CONNECT bodies ───────────────────────────────────────────────────

/// Server handshake and runtime announcement, the JSON body of `INFO`.
///
/// Unknown fields are ignored so newer servers keep working.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub proto: i32,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub lame_duck_mode: bool,
}

impl ServerInfo {
    pub(crate) fn parse(json: &[u8]) -> Result<ServerInfo> {
        serde_json::from_slice(json)
            .map_err(|e| Error::Protocol(format!("malformed INFO body: {e}")))
    }
}

/// The JSON body of the `CONNECT` line.
///
/// `skip_serializing_if` keeps credential fields off the wire entirely when
/// they are unused, matching what servers expect from existing clients.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: i32,
    pub echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl ConnectInfo {
    /// Renders `CONNECT {json}\r\n`.
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)
            .map_err(|e| Error::Protocol(format!("cannot encode CONNECT: {e}")))?;
        let mut line = Vec::with_capacity(body.len() + 10);
        line.extend_from_slice(b"CONNECT ");
        line.extend_from_slice(&body);
        line.extend_from_slice(CRLF);
        Ok(line)
    }
}

// ─── Command encoders ────────────────────────────────────────────────────────

/// Appends `PUB <subject> [reply] <size>\r\n<payload>\r\n` to `buf`.
pub(crate) fn encode_pub(buf: &mut Vec<u8>, subject: &str, reply: Option<&str>, payload: &[u8]) {
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.push(b' ');
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.push(b' ');
    push_int(buf, payload.len() as u64);
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

/// Appends `SUB <subject> [queue] <sid>\r\n` to `buf`.
pub(crate) fn encode_sub(buf: &mut Vec<u8>, subject: &str, queue: Option<&str>, sid: u64) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(queue) = queue {
        buf.push(b' ');
        buf.extend_from_slice(queue.as_bytes());
    }
    buf.push(b' ');
    push_int(buf, sid);
    buf.extend_from_slice(CRLF);
}

/// Appends `UNSUB <sid> [max]\r\n` to `buf`.
pub(crate) fn encode_unsub(buf: &mut Vec<u8>, sid: u64, max: Option<u64>) {
    buf.extend_from_slice(b"UNSUB ");
    push_int(buf, sid);
    if let Some(max) = max {
        buf.push(b' ');
        push_int(buf, max);
    }
    buf.extend_from_slice(CRLF);
}

fn push_int(buf: &mut Vec<u8>, v: u64) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    let mut v = v;
    loop {
        i -= 1;
        digits[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    buf.extend_from_slice(&digits[i..]);
}

// ─── Subject validation ──────────────────────────────────────────────────────

/// Validates a subject for publishing: non-empty dotted tokens, no wildcards.
pub(crate) fn validate_publish_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || !subject.split('.').all(|t| is_plain_token(t)) {
        return Err(Error::InvalidSubject);
    }
    Ok(())
}

/// Validates a subscription subject: `*` matches one token, `>` only as the
/// final token.
pub(crate) fn validate_subscribe_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(Error::InvalidSubject);
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        let valid = match *token {
            "*" => true,
            ">" => i == tokens.len() - 1,
            t => is_plain_token(t),
        };
        if !valid {
            return Err(Error::InvalidSubject);
        }
    }
    Ok(())
}

/// Queue group names are a single non-empty token.
pub(crate) fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() || !is_plain_token(queue) {
        return Err(Error::InvalidQueueName);
    }
    Ok(())
}

fn is_plain_token(token: &str) -> bool {
    // Printable, no separators or wildcards; multi-byte UTF-8 passes.
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b > b' ' && b != b'.' && b != b'*' && b != b'>')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trips_all_fields() {
        let connect = ConnectInfo {
            verbose: true,
            pedantic: true,
            tls_required: false,
            name: Some("natslink-test".into()),
            lang: CLIENT_LANG,
            version: CLIENT_VERSION,
            protocol: 1,
            echo: false,
            user: Some("derek".into()),
            pass: Some("s3cr3t".into()),
            auth_token: None,
            jwt: None,
            nkey: None,
            sig: None,
        };
        let line = connect.encode().unwrap();
        assert!(line.starts_with(b"CONNECT {"));
        assert!(line.ends_with(b"\r\n"));

        let body: serde_json::Value =
            serde_json::from_slice(&line[b"CONNECT ".len()..line.len() - 2]).unwrap();
        assert_eq!(body["verbose"], true);
        assert_eq!(body["pedantic"], true);
        assert_eq!(body["echo"], false);
        assert_eq!(body["lang"], "rust");
        assert_eq!(body["protocol"], 1);
        assert_eq!(body["user"], "derek");
        assert_eq!(body["pass"], "s3cr3t");
        // Unused credential fields must stay off the wire.
        assert!(body.get("auth_token").is_none());
        assert!(body.get("jwt").is_none());
    }

    #[test]
    fn info_parses_known_fields_ignores_unknown() {
        let info = ServerInfo::parse(
            br#"{"server_id":"S1","version":"2.9.0","max_payload":1048576,"proto":1,
                "auth_required":true,"tls_required":false,"client_id":42,
                "connect_urls":["10.0.0.2:4222"],"lame_duck_mode":false,
                "some_future_field":{"x":1}}"#,
        )
        .unwrap();
        assert_eq!(info.server_id, "S1");
        assert_eq!(info.max_payload, 1_048_576);
        assert!(info.auth_required);
        assert_eq!(info.connect_urls, vec!["10.0.0.2:4222".to_string()]);
    }

    #[test]
    fn pub_encoding_with_and_without_reply() {
        let mut buf = Vec::new();
        encode_pub(&mut buf, "foo", None, b"hello");
        assert_eq!(buf, b"PUB foo 5\r\nhello\r\n");

        buf.clear();
        encode_pub(&mut buf, "foo", Some("_INBOX.abc.1"), b"");
        assert_eq!(buf, b"PUB foo _INBOX.abc.1 0\r\n\r\n");
    }

    #[test]
    fn sub_and_unsub_encoding() {
        let mut buf = Vec::new();
        encode_sub(&mut buf, "a.*", Some("workers"), 7);
        assert_eq!(buf, b"SUB a.* workers 7\r\n");

        buf.clear();
        encode_unsub(&mut buf, 7, Some(2));
        assert_eq!(buf, b"UNSUB 7 2\r\n");

        buf.clear();
        encode_unsub(&mut buf, 9, None);
        assert_eq!(buf, b"UNSUB 9\r\n");
    }

    #[test]
    fn subject_validation() {
        assert!(validate_publish_subject("foo.bar").is_ok());
        assert!(validate_publish_subject("").is_err());
        assert!(validate_publish_subject("foo..bar").is_err());
        assert!(validate_publish_subject("foo bar").is_err());
        assert!(validate_publish_subject("foo.*").is_err());

        assert!(validate_subscribe_subject("a.*").is_ok());
        assert!(validate_subscribe_subject("a.>").is_ok());
        assert!(validate_subscribe_subject(">.a").is_err());
        assert!(validate_subscribe_subject("").is_err());

        assert!(validate_queue_name("workers").is_ok());
        assert!(validate_queue_name("two words").is_err());
        assert!(validate_queue_name("").is_err());
    }
}
