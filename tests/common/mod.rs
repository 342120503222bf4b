//! In-process mock NATS server for integration tests.
//!
//! Speaks just enough of the wire protocol to exercise the client end to
//! end: INFO on accept, CONNECT/PING/PONG, SUB/UNSUB bookkeeping (with
//! wildcard matching and auto-unsubscribe counts), and PUB routing across
//! every live connection, including echo suppression for connections that
//! sent `echo:false`.
//!
//! Accepted sockets use linger 0 so `stop()` closes abortively and the same
//! port can be rebound immediately for restart scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Counters the tests assert on.
#[derive(Default)]
pub struct ServerStats {
    pub connections: AtomicU64,
    pub pubs: AtomicU64,
    pub pings: AtomicU64,
    pub pongs: AtomicU64,
    pub subs: AtomicU64,
    pub unsubs: AtomicU64,
}

pub struct MockConfig {
    pub max_payload: usize,
    /// Reject CONNECTs whose `auth_token` differs from this.
    pub expected_token: Option<String>,
    pub server_id: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            max_payload: 1024 * 1024,
            expected_token: None,
            server_id: "mock".to_string(),
        }
    }
}

struct SubEntry {
    conn_id: u64,
    sid: u64,
    pattern: String,
    queue: Option<String>,
    /// Auto-unsubscribe budget from `UNSUB <sid> <max>`, absolute.
    max: Option<u64>,
    delivered: u64,
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    echo: bool,
}

#[derive(Default)]
struct Registry {
    conns: HashMap<u64, ConnHandle>,
    subs: Vec<SubEntry>,
    rr: u64,
}

pub struct MockServer {
    port: u16,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    registry: Arc<Mutex<Registry>>,
    pub stats: Arc<ServerStats>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_on(0, MockConfig::default()).await
    }

    pub async fn start_with(cfg: MockConfig) -> Self {
        Self::start_on(0, cfg).await
    }

    /// Binds to a specific port (0 picks a free one). Restart scenarios stop
    /// a server and start a new one on the same port.
    pub async fn start_on(port: u16, cfg: MockConfig) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("mock server bind");
        let port = listener.local_addr().unwrap().port();
        let registry: Arc<Mutex<Registry>> = Arc::default();
        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let stats: Arc<ServerStats> = Arc::default();
        let cfg = Arc::new(cfg);

        let accept_registry = registry.clone();
        let accept_tasks = conn_tasks.clone();
        let accept_stats = stats.clone();
        let accept_task = tokio::spawn(async move {
            let mut next_conn_id = 1u64;
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                // Abortive close on drop, so tests can rebind the port.
                let _ = socket.set_linger(Some(Duration::ZERO));
                let _ = socket.set_nodelay(true);
                let conn_id = next_conn_id;
                next_conn_id += 1;
                accept_stats.connections.fetch_add(1, Ordering::SeqCst);
                let task = tokio::spawn(serve_conn(
                    socket,
                    conn_id,
                    accept_registry.clone(),
                    accept_stats.clone(),
                    cfg.clone(),
                ));
                accept_tasks.lock().unwrap().push(task);
            }
        });

        Self {
            port,
            accept_task,
            conn_tasks,
            registry,
            stats,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.port)
    }

    /// Sends raw protocol bytes to every live connection (e.g. `PING\r\n` or
    /// an async `INFO {...}\r\n`).
    pub fn broadcast(&self, bytes: &[u8]) {
        let registry = self.registry.lock().unwrap();
        for conn in registry.conns.values() {
            let _ = conn.tx.send(bytes.to_vec());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().conns.len()
    }

    /// Stops accepting and drops every connection (abortively, thanks to
    /// linger 0).
    pub async fn stop(self) {
        self.accept_task.abort();
        // Aborting a serve task drops its read half and channel sender; the
        // writer task then observes the closed channel and drops the write
        // half, which resets the socket.
        for task in self.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.registry.lock().unwrap().conns.clear();
        // Give the writer tasks a moment to unwind and close the sockets.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn serve_conn(
    socket: TcpStream,
    conn_id: u64,
    registry: Arc<Mutex<Registry>>,
    stats: Arc<ServerStats>,
    cfg: Arc<MockConfig>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let info = format!(
        "INFO {{\"server_id\":\"{}\",\"version\":\"2.9.0-mock\",\"proto\":1,\"max_payload\":{}}}\r\n",
        cfg.server_id, cfg.max_payload
    );
    let _ = tx.send(info.into_bytes());
    registry.lock().unwrap().conns.insert(
        conn_id,
        ConnHandle {
            tx: tx.clone(),
            echo: true,
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                return;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        if read_line(&mut reader, &mut line).await.is_err() || line.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let mut parts = text.split_ascii_whitespace();
        match parts.next().map(str::to_ascii_uppercase).as_deref() {
            Some("CONNECT") => {
                let body: serde_json::Value =
                    serde_json::from_str(text.splitn(2, ' ').nth(1).unwrap_or("{}"))
                        .unwrap_or_default();
                let echo = body.get("echo").and_then(|v| v.as_bool()).unwrap_or(true);
                let verbose = body.get("verbose").and_then(|v| v.as_bool()).unwrap_or(false);
                if let Some(expected) = &cfg.expected_token {
                    let token = body.get("auth_token").and_then(|v| v.as_str());
                    if token != Some(expected.as_str()) {
                        let _ = tx.send(b"-ERR 'Authorization Violation'\r\n".to_vec());
                        break;
                    }
                }
                if let Some(conn) = registry.lock().unwrap().conns.get_mut(&conn_id) {
                    conn.echo = echo;
                }
                if verbose {
                    let _ = tx.send(b"+OK\r\n".to_vec());
                }
            }
            Some("PING") => {
                stats.pings.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(b"PONG\r\n".to_vec());
            }
            Some("PONG") => {
                stats.pongs.fetch_add(1, Ordering::SeqCst);
            }
            Some("SUB") => {
                let tokens: Vec<&str> = parts.collect();
                let (pattern, queue, sid) = match tokens.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, queue, sid] => (*subject, Some(queue.to_string()), *sid),
                    _ => break,
                };
                let Ok(sid) = sid.parse::<u64>() else { break };
                stats.subs.fetch_add(1, Ordering::SeqCst);
                registry.lock().unwrap().subs.push(SubEntry {
                    conn_id,
                    sid,
                    pattern: pattern.to_string(),
                    queue,
                    max: None,
                    delivered: 0,
                });
            }
            Some("UNSUB") => {
                let tokens: Vec<&str> = parts.collect();
                stats.unsubs.fetch_add(1, Ordering::SeqCst);
                let Some(Ok(sid)) = tokens.first().map(|s| s.parse::<u64>()) else {
                    break;
                };
                let max = tokens.get(1).and_then(|s| s.parse::<u64>().ok());
                let mut registry = registry.lock().unwrap();
                match max {
                    None => registry
                        .subs
                        .retain(|s| !(s.conn_id == conn_id && s.sid == sid)),
                    Some(max) => {
                        registry.subs.retain_mut(|s| {
                            if s.conn_id == conn_id && s.sid == sid {
                                if s.delivered >= max {
                                    return false;
                                }
                                s.max = Some(max);
                            }
                            true
                        });
                    }
                }
            }
            Some("PUB") => {
                let tokens: Vec<&str> = parts.collect();
                let (subject, reply, size) = match tokens.as_slice() {
                    [subject, size] => (*subject, None, *size),
                    [subject, reply, size] => (*subject, Some(reply.to_string()), *size),
                    _ => break,
                };
                let Ok(size) = size.parse::<usize>() else { break };
                let mut payload = vec![0u8; size + 2];
                if reader.read_exact(&mut payload).await.is_err() {
                    break;
                }
                payload.truncate(size);
                stats.pubs.fetch_add(1, Ordering::SeqCst);
                route(
                    &registry,
                    conn_id,
                    subject,
                    reply.as_deref(),
                    &payload,
                );
            }
            _ => break,
        }
    }

    {
        let mut registry = registry.lock().unwrap();
        registry.conns.remove(&conn_id);
        registry.subs.retain(|s| s.conn_id != conn_id);
    }
    writer.abort();
}

/// Reads one `\r\n`-terminated line, without the terminator.
async fn read_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(());
        }
        line.push(byte[0]);
    }
}

/// Delivers one publish to every matching subscription, honoring echo
/// suppression and picking one member per queue group.
fn route(
    registry: &Arc<Mutex<Registry>>,
    publisher: u64,
    subject: &str,
    reply: Option<&str>,
    payload: &[u8],
) {
    let mut registry = registry.lock().unwrap();
    registry.rr += 1;
    let rr = registry.rr;
    let publisher_echo = registry
        .conns
        .get(&publisher)
        .map_or(true, |c| c.echo);

    // Queue groups get exactly one delivery each.
    let mut queue_winners: HashMap<String, usize> = HashMap::new();
    let mut targets: Vec<usize> = Vec::new();
    for (i, sub) in registry.subs.iter().enumerate() {
        if !subject_matches(&sub.pattern, subject) {
            continue;
        }
        if sub.conn_id == publisher && !publisher_echo {
            continue;
        }
        match &sub.queue {
            None => targets.push(i),
            Some(queue) => {
                queue_winners
                    .entry(queue.clone())
                    .and_modify(|w| {
                        if rr % 2 == 0 {
                            *w = i;
                        }
                    })
                    .or_insert(i);
            }
        }
    }
    targets.extend(queue_winners.into_values());

    let mut exhausted: Vec<(u64, u64)> = Vec::new();
    for i in targets {
        let (conn_id, sid) = {
            let sub = &mut registry.subs[i];
            sub.delivered += 1;
            if sub.max.is_some_and(|m| sub.delivered >= m) {
                exhausted.push((sub.conn_id, sub.sid));
            }
            (sub.conn_id, sub.sid)
        };
        let mut frame = Vec::with_capacity(payload.len() + 64);
        frame.extend_from_slice(b"MSG ");
        frame.extend_from_slice(subject.as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(sid.to_string().as_bytes());
        if let Some(reply) = reply {
            frame.push(b' ');
            frame.extend_from_slice(reply.as_bytes());
        }
        frame.push(b' ');
        frame.extend_from_slice(payload.len().to_string().as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        if let Some(conn) = registry.conns.get(&conn_id) {
            let _ = conn.tx.send(frame);
        }
    }
    for (conn_id, sid) in exhausted {
        registry
            .subs
            .retain(|s| !(s.conn_id == conn_id && s.sid == sid));
    }
}

/// NATS subject matching: `*` is one token, `>` the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

/// Polls `cond` until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
