// SPDX-License-Identifier: MIT
//! Incremental protocol parser.
//!
//! Feeds on raw socket bytes and produces [`ServerOp`] events. The parser is
//! line-oriented except for MSG payloads, which are length-prefixed by the
//! MSG arguments line and followed by a trailing CRLF.
//!
//! Reads can split an operation anywhere, including inside the CRLF pair.
//! When that happens the partial line or payload is carried over into an
//! internal scratch buffer; when a full operation lies inside one read the
//! parser works directly on the input slice.
//!
//! Malformed input is fatal: the parser returns [`Error::Protocol`] and the
//! connection must drop the socket and go through reconnect.

use crate::errors::{Error, Result};
use crate::protocol::ServerInfo;

/// Largest accepted MSG arguments or control line. Matches the server's own
/// default limit and bounds scratch growth on garbage input.
const MAX_CONTROL_LINE: usize = 4096;

/// A single protocol event from the server.
#[derive(Debug)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Header of the MSG currently being collected.
#[derive(Debug)]
struct MsgArgs {
    subject: String,
    sid: u64,
    reply: Option<String>,
    size: usize,
}

#[derive(Debug)]
enum State {
    /// Collecting a `\r\n`-terminated control line.
    Line,
    /// Collecting `size` payload bytes for the pending MSG.
    Payload(MsgArgs),
    /// Consuming the CRLF that trails a payload.
    PayloadEnd {
        op: Box<ServerOp>,
        /// `\r` already consumed in a previous read.
        seen_cr: bool,
    },
}

/// Stateful byte-stream parser. The read loop is its sole owner.
pub struct Parser {
    state: State,
    /// Carry-over for a line or payload spanning reads.
    scratch: Vec<u8>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Line,
            scratch: Vec::new(),
        }
    }

    /// Consumes one read's worth of bytes, appending every completed
    /// operation to `ops`.
    pub fn parse(&mut self, mut buf: &[u8], ops: &mut Vec<ServerOp>) -> Result<()> {
        while !buf.is_empty() {
            match std::mem::replace(&mut self.state, State::Line) {
                State::Line => {
                    // A CRLF pair can straddle two reads: the CR sits at the
                    // end of scratch, the LF opens this buffer.
                    if buf[0] == b'\n' && self.scratch.last() == Some(&b'\r') {
                        self.scratch.pop();
                        let line = std::mem::take(&mut self.scratch);
                        buf = &buf[1..];
                        self.complete_line(&line, ops)?;
                        continue;
                    }
                    match find_crlf(buf) {
                        Some(eol) => {
                            if self.scratch.is_empty() {
                                // Whole line in this read: parse the slice
                                // directly, no copy.
                                let line = &buf[..eol];
                                buf = &buf[eol + 2..];
                                self.complete_line(line, ops)?;
                            } else {
                                self.scratch.extend_from_slice(&buf[..eol]);
                                if self.scratch.len() > MAX_CONTROL_LINE {
                                    return Err(Error::Protocol("control line too long".into()));
                                }
                                let line = std::mem::take(&mut self.scratch);
                                buf = &buf[eol + 2..];
                                self.complete_line(&line, ops)?;
                            }
                        }
                        None => {
                            // Partial line; `\r` may even be the final byte
                            // with its `\n` in the next read.
                            self.scratch.extend_from_slice(buf);
                            if self.scratch.len() > MAX_CONTROL_LINE {
                                return Err(Error::Protocol("control line too long".into()));
                            }
                            return Ok(());
                        }
                    }
                }
                State::Payload(args) => {
                    let needed = args.size - self.scratch.len();
                    if buf.len() >= needed {
                        let payload = if self.scratch.is_empty() {
                            buf[..needed].to_vec()
                        } else {
                            self.scratch.extend_from_slice(&buf[..needed]);
                            std::mem::take(&mut self.scratch)
                        };
                        buf = &buf[needed..];
                        self.state = State::PayloadEnd {
                            op: Box::new(msg_op(args, payload)),
                            seen_cr: false,
                        };
                    } else {
                        self.scratch.extend_from_slice(buf);
                        self.state = State::Payload(args);
                        return Ok(());
                    }
                }
                State::PayloadEnd { op, seen_cr } => {
                    if !seen_cr {
                        if buf[0] != b'\r' {
                            return Err(Error::Protocol("missing CR after payload".into()));
                        }
                        buf = &buf[1..];
                        self.state = State::PayloadEnd { op, seen_cr: true };
                        continue;
                    }
                    if buf[0] != b'\n' {
                        return Err(Error::Protocol("missing LF after payload".into()));
                    }
                    buf = &buf[1..];
                    ops.push(*op);
                }
            }
        }
        Ok(())
    }

    /// Dispatches one complete control line and advances the state.
    fn complete_line(&mut self, line: &[u8], ops: &mut Vec<ServerOp>) -> Result<()> {
        match parse_line(line)? {
            Line::Op(op) => ops.push(op),
            Line::Msg(args) if args.size == 0 => {
                // Zero-length payload: only the trailing CRLF remains.
                self.state = State::PayloadEnd {
                    op: Box::new(msg_op(args, Vec::new())),
                    seen_cr: false,
                };
            }
            Line::Msg(args) => self.state = State::Payload(args),
        }
        Ok(())
    }
}

fn msg_op(args: MsgArgs, payload: Vec<u8>) -> ServerOp {
    ServerOp::Msg {
        subject: args.subject,
        sid: args.sid,
        reply: args.reply,
        payload,
    }
}

/// Finds the index of `\r` in a `\r\n` pair, scanning only this slice.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = memchr(b'\r', &buf[from..]) {
        let at = from + pos;
        if buf.get(at + 1) == Some(&b'\n') {
            return Some(at);
        }
        if at + 1 == buf.len() {
            // CR is the final byte; caller must carry over.
            return None;
        }
        from = at + 1;
    }
    None
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

enum Line {
    Op(ServerOp),
    Msg(MsgArgs),
}

/// Parses one complete control line (without its CRLF).
fn parse_line(line: &[u8]) -> Result<Line> {
    if line.starts_with(b"MSG ") || line.starts_with(b"MSG\t") {
        return parse_msg_args(&line[4..]).map(Line::Msg);
    }
    if line.eq_ignore_ascii_case(b"PING") {
        return Ok(Line::Op(ServerOp::Ping));
    }
    if line.eq_ignore_ascii_case(b"PONG") {
        return Ok(Line::Op(ServerOp::Pong));
    }
    if line == b"+OK" {
        return Ok(Line::Op(ServerOp::Ok));
    }
    if let Some(rest) = line.strip_prefix(b"-ERR") {
        let text = std::str::from_utf8(rest)
            .map_err(|_| Error::Protocol("-ERR text is not UTF-8".into()))?
            .trim()
            .trim_matches('\'');
        return Ok(Line::Op(ServerOp::Err(text.to_string())));
    }
    if let Some(rest) = line.strip_prefix(b"INFO ") {
        return Ok(Line::Op(ServerOp::Info(ServerInfo::parse(rest)?)));
    }
    Err(Error::Protocol(format!(
        "unknown protocol operation: {:?}",
        String::from_utf8_lossy(&line[..line.len().min(32)])
    )))
}

/// `<subject> <sid> [reply] <size>`: three or four whitespace-separated
/// tokens.
fn parse_msg_args(args: &[u8]) -> Result<MsgArgs> {
    let args =
        std::str::from_utf8(args).map_err(|_| Error::Protocol("MSG args not UTF-8".into()))?;
    let tokens: Vec<&str> = args.split_ascii_whitespace().collect();
    let (subject, sid, reply, size) = match tokens.as_slice() {
        [subject, sid, size] => (*subject, *sid, None, *size),
        [subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
        _ => return Err(Error::Protocol(format!("malformed MSG args: {args:?}"))),
    };
    let sid = sid
        .parse::<u64>()
        .map_err(|_| Error::Protocol(format!("bad sid in MSG args: {args:?}")))?;
    let size = size
        .parse::<usize>()
        .map_err(|_| Error::Protocol(format!("bad size in MSG args: {args:?}")))?;
    Ok(MsgArgs {
        subject: subject.to_string(),
        sid,
        reply,
        size,
    })
}
