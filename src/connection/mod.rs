// SPDX-License-Identifier: MIT
//! The connection: state machine, I/O tasks, and reconnect driver.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──handshake ok──► Connected
//!                                  ▲                          │ socket error / stale
//!                                  └────── Reconnecting ◄─────┘
//! Connected ──drain()──► DrainingSubs ──► DrainingPubs ──► Closed
//! any ──close()──► Closed
//! ```
//!
//! Per connected socket the connection runs three tasks: the **read loop**
//! (sole owner of the read half and the parser), the **flusher** (sole writer
//! to the socket), and the **ping timer**. A supervisor loop owns them: it
//! performs the handshake, watches for the first failure, tears the socket
//! down and drives reconnection, the same shape as a reconnecting client
//! loop with backoff around a select over its worker tasks.
//!
//! One `std::sync::Mutex` guards all shared connection state and is never
//! held across an await. Each subscription carries its own queue lock so
//! delivery never contends here. User callbacks run on a dedicated
//! async-callback task, outside every lock, serialized in event order.

mod socket;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::delivery;
use crate::errors::{Error, Result};
use crate::message::Message;
use crate::options::{MessageHandler, Options};
use crate::outbound::WriteBuffer;
use crate::parser::{Parser, ServerOp};
use crate::protocol::{self, ConnectInfo, ServerInfo, CLIENT_LANG, CLIENT_VERSION, PING_OP, PONG_OP};
use crate::request::{new_inbox, RequestMux};
use crate::servers::{Candidate, ServerPool};
use crate::stats::Statistics;
use crate::subscription::{CloseReason, DeliveryMode, Enqueued, SubInner, Subscription};
use crate::auth;

use socket::Stream;

/// Upper bound on the random jitter added to reconnect waits and the
/// lame-duck evacuation delay.
const RECONNECT_JITTER: Duration = Duration::from_millis(100);
/// How often `drain` re-checks that subscriptions have finished.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    DrainingSubs,
    DrainingPubs,
    Closed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Disconnected => "disconnected",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Reconnecting => "reconnecting",
            Status::DrainingSubs => "draining_subs",
            Status::DrainingPubs => "draining_pubs",
            Status::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Notifications handed to the async-callback worker.
enum Event {
    Closed,
    Disconnected,
    Reconnected,
    Discovered,
    ConnectedRetry,
    Error { subject: Option<String>, error: Error },
}

/// Everything mutable, under the single connection lock.
struct Shared {
    status: Status,
    pool: ServerPool,
    current: Option<usize>,
    info: ServerInfo,
    buffer: WriteBuffer,
    subs: HashMap<u64, Arc<SubInner>>,
    /// Insertion order, for re-subscribing after a reconnect.
    sub_order: Vec<u64>,
    next_sid: u64,
    /// Waiters for the PONGs answering `flush` PINGs, oldest first.
    pong_waiters: VecDeque<oneshot::Sender<std::result::Result<(), ()>>>,
    /// Timer PINGs not yet answered.
    pings_out: u32,
    stats: Statistics,
    mux: Option<Arc<RequestMux>>,
    close_requested: bool,
    /// Set once a handshake has ever completed, to tell the connected-retry
    /// callback from the reconnected callback.
    ever_connected: bool,
    last_error: Option<String>,
}

/// Shared core of a connection. Public API lives on [`Connection`].
pub(crate) struct ConnectionInner {
    opts: Options,
    shared: Mutex<Shared>,
    /// Wakes the flusher.
    flush_notify: Notify,
    /// Close signal for the supervisor; a watch so it cannot be missed.
    close_tx: watch::Sender<bool>,
    /// Generation watermark of bytes that reached the socket.
    flushed_tx: watch::Sender<u64>,
    status_tx: watch::Sender<Status>,
    events: mpsc::UnboundedSender<Event>,
    runtime: Handle,
}

/// A handle to one connection. Cheap to clone; all clones share the same
/// connection and it stays alive until [`close`](Connection::close) (or the
/// server pool is exhausted).
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

/// Result of a successful handshake, before the socket is split.
struct Established {
    stream: Stream,
    /// Bytes read past the handshake; fed to the parser first.
    leftover: Vec<u8>,
    idx: usize,
    info: ServerInfo,
}

enum RunEnd {
    Failed(Error),
    CloseRequested,
}

// ─── Public API ──────────────────────────────────────────────────────────────

impl Connection {
    /// Connects to the first reachable server in `options.urls`.
    ///
    /// With `retry_on_failed_connect`, a connection object is returned even
    /// when no server is reachable right now; it keeps trying in the
    /// background and the `connected_callback` fires on success (the status
    /// is `Reconnecting` until then).
    pub async fn connect(options: Options) -> Result<Connection> {
        options.validate()?;
        let runtime = match &options.runtime {
            Some(handle) => handle.clone(),
            None => Handle::current(),
        };
        let pool = ServerPool::seed(&options.urls, !options.no_randomize)?;
        let (status_tx, _) = watch::channel(Status::Connecting);
        let (flushed_tx, _) = watch::channel(0u64);
        let (close_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ConnectionInner {
            shared: Mutex::new(Shared {
                status: Status::Connecting,
                pool,
                current: None,
                info: ServerInfo::default(),
                buffer: WriteBuffer::new(options.reconnect_buf_size),
                subs: HashMap::new(),
                sub_order: Vec::new(),
                next_sid: 1,
                pong_waiters: VecDeque::new(),
                pings_out: 0,
                stats: Statistics::default(),
                mux: None,
                close_requested: false,
                ever_connected: false,
                last_error: None,
            }),
            opts: options,
            flush_notify: Notify::new(),
            close_tx,
            flushed_tx,
            status_tx,
            events: events_tx,
            runtime: runtime.clone(),
        });
        spawn_callback_worker(&runtime, events_rx, Arc::downgrade(&inner));

        match initial_connect(&inner).await {
            Ok(est) => {
                let conn = Connection {
                    inner: inner.clone(),
                };
                let mut status_rx = inner.status_tx.subscribe();
                runtime.spawn(conn_loop(inner, Some(est)));
                // The handshake is done; wait for the supervisor to finish
                // installing the socket so callers see a live connection.
                let _ = status_rx.wait_for(|s| *s != Status::Connecting).await;
                Ok(conn)
            }
            Err(err) if inner.opts.retry_on_failed_connect => {
                info!(err = %err, "connect: no server reachable, retrying in the background");
                inner.set_last_error(&err);
                inner.set_status(Status::Reconnecting);
                {
                    let mut shared = inner.shared.lock().unwrap();
                    shared.buffer.enter_pending();
                }
                let conn = Connection {
                    inner: inner.clone(),
                };
                runtime.spawn(conn_loop(inner, None));
                Ok(conn)
            }
            Err(err) => {
                inner.set_status(Status::Closed);
                Err(err)
            }
        }
    }

    /// Connects to a URL (or comma-separated list) with default options.
    pub async fn connect_to(url: &str) -> Result<Connection> {
        Self::connect(Options::with_url(url)).await
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        self.inner.shared.lock().unwrap().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == Status::Reconnecting
    }

    /// Traffic counters; `reconnects` lets callers detect a disconnect
    /// between two observations.
    pub fn stats(&self) -> Statistics {
        self.inner.shared.lock().unwrap().stats
    }

    /// Last asynchronous error, as diagnostic text.
    pub fn last_error(&self) -> Option<String> {
        self.inner.shared.lock().unwrap().last_error.clone()
    }

    /// Maximum payload the current server accepts.
    pub fn max_payload(&self) -> usize {
        self.inner.shared.lock().unwrap().info.max_payload
    }

    /// INFO of the server currently connected to.
    pub fn server_info(&self) -> ServerInfo {
        self.inner.shared.lock().unwrap().info.clone()
    }

    /// `host:port` of every endpoint in the pool, seeded and discovered.
    pub fn servers(&self) -> Vec<String> {
        self.inner.shared.lock().unwrap().pool.addresses()
    }

    /// `host:port` of the endpoints learned from server INFO announcements.
    pub fn discovered_servers(&self) -> Vec<String> {
        self.inner.shared.lock().unwrap().pool.discovered_addresses()
    }

    /// A fresh unique inbox subject, usable as a reply address.
    pub fn new_inbox(&self) -> String {
        new_inbox()
    }

    /// Publishes `payload` on `subject`.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.publish_with_reply(subject, None, payload).await
    }

    /// Publishes with a reply subject for the receiver to respond to.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<()> {
        protocol::validate_publish_subject(subject)?;
        if let Some(reply) = reply {
            protocol::validate_subscribe_subject(reply)?;
        }
        let (gen, pending) = self.inner.publish_bytes(subject, reply, payload)?;
        // Bytes parked in the pending-publish buffer cannot reach the socket
        // until the reconnect completes; send-asap only waits for live ones.
        if self.inner.opts.send_asap && !pending {
            self.inner.wait_flushed(gen).await?;
        }
        Ok(())
    }

    /// Subscribes with an asynchronous handler. The handler receives `None`
    /// only for subscriptions created with a timeout.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Option<Message>) + Send + Sync + 'static,
    {
        self.inner
            .subscribe_impl(subject, None, Some(Arc::new(handler)), None, false)
    }

    /// Asynchronous subscription within a queue group.
    pub fn queue_subscribe<F>(&self, subject: &str, queue: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Option<Message>) + Send + Sync + 'static,
    {
        self.inner
            .subscribe_impl(subject, Some(queue), Some(Arc::new(handler)), None, false)
    }

    /// Asynchronous subscription that also reports idle periods: after
    /// `timeout` without deliveries the handler is invoked once with `None`.
    /// The timeout must be positive.
    pub fn subscribe_with_timeout<F>(
        &self,
        subject: &str,
        timeout: Duration,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Option<Message>) + Send + Sync + 'static,
    {
        if timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }
        self.inner
            .subscribe_impl(subject, None, Some(Arc::new(handler)), Some(timeout), false)
    }

    /// Synchronous subscription; consume with
    /// [`next_msg`](Subscription::next_msg).
    pub fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        self.inner.subscribe_impl(subject, None, None, None, false)
    }

    /// Synchronous subscription within a queue group.
    pub fn queue_subscribe_sync(&self, subject: &str, queue: &str) -> Result<Subscription> {
        self.inner
            .subscribe_impl(subject, Some(queue), None, None, false)
    }

    /// Round-trip request: publishes `payload` on `subject` and waits for the
    /// response.
    ///
    /// Uses the shared reply inbox unless the connection was configured with
    /// `use_old_request_style`.
    pub async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Message> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidTimeout);
        }
        if self.inner.opts.use_old_request_style {
            return self.request_old(subject, payload, timeout).await;
        }
        let mux = self.inner.ensure_mux()?;
        let (token, reply, rx) = mux.register();
        let result = async {
            self.publish_with_reply(subject, Some(&reply), payload).await?;
            match timeout {
                Some(t) => match tokio::time::timeout(t, rx).await {
                    Ok(Ok(msg)) => Ok(msg),
                    Ok(Err(_)) => Err(Error::ConnectionClosed),
                    Err(_) => Err(Error::Timeout(t)),
                },
                None => rx.await.map_err(|_| Error::ConnectionClosed),
            }
        }
        .await;
        mux.release(&token);
        result
    }

    /// Pre-multiplexer request style: a one-shot subscription on a unique
    /// inbox with auto-unsubscribe 1.
    async fn request_old(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let inbox = new_inbox();
        let sub = self.inner.subscribe_impl(&inbox, None, None, None, true)?;
        sub.auto_unsubscribe(1)?;
        self.publish_with_reply(subject, Some(&inbox), payload).await?;
        let result = sub.next_msg(timeout).await;
        if sub.is_valid() {
            let _ = sub.unsubscribe();
        }
        result
    }

    /// Sends a PING and waits for the server's PONG, proving every prior
    /// command on this connection has been processed.
    ///
    /// If the socket dies while the PONG is in flight this returns
    /// `Disconnected`; whether publishes before the PING were received is
    /// indeterminate (check [`stats`](Connection::stats) for `reconnects`).
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidTimeout);
        }
        let rx = self.inner.register_flush_ping()?;
        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(res) => res,
                Err(_) => return Err(Error::Timeout(t)),
            },
            None => rx.await,
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(())) => Err(Error::Disconnected),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Drains the connection: stops all subscriptions, lets their queued
    /// messages flow through the handlers, flushes outstanding publishes,
    /// then closes. A second call fails with `Draining`.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<()> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidTimeout);
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let subs = self.inner.begin_drain()?;
        for sub in &subs {
            sub.start_drain();
            match sub.mode {
                DeliveryMode::Pool => delivery::signal_drain(&self.inner.runtime, sub),
                DeliveryMode::Sync => {
                    // No consumer may be waiting; close right away if there
                    // is nothing left to hand out.
                    if sub.drained_empty() {
                        Subscription { inner: sub.clone() }.finish(CloseReason::Drained);
                    }
                }
                DeliveryMode::Owned => {}
            }
        }

        // Wait for every subscription to finish draining.
        loop {
            if self.inner.shared.lock().unwrap().subs.is_empty() {
                break;
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                warn!("drain: timed out waiting for subscriptions, forcing");
                let remaining: Vec<_> = {
                    let shared = self.inner.shared.lock().unwrap();
                    shared.subs.values().cloned().collect()
                };
                for sub in remaining {
                    Subscription { inner: sub }.finish(CloseReason::Drained);
                }
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.inner.set_status(Status::DrainingPubs);
        let remaining = deadline.map(|d| d.saturating_duration_since(tokio::time::Instant::now()));
        if self.flush_draining(remaining).await.is_err() {
            debug!("drain: final flush did not complete");
        }
        self.close().await;
        Ok(())
    }

    /// `flush` variant that is allowed while draining publishes.
    async fn flush_draining(&self, timeout: Option<Duration>) -> Result<()> {
        let rx = self.inner.register_ping_waiter()?;
        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(res) => res,
                Err(_) => return Err(Error::Timeout(t)),
            },
            None => rx.await,
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::Disconnected),
        }
    }

    /// Closes the connection, cancelling every waiter. Idempotent; the
    /// closed callback fires exactly once.
    pub async fn close(&self) {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.status == Status::Closed {
                return;
            }
            shared.close_requested = true;
        }
        let _ = self.inner.close_tx.send(true);

        let mut status_rx = self.inner.status_tx.subscribe();
        loop {
            if *status_rx.borrow() == Status::Closed {
                return;
            }
            if status_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared.lock().unwrap();
        f.debug_struct("Connection")
            .field("status", &shared.status)
            .field("server", &shared.current.and_then(|i| shared.pool.get(i)).map(|e| e.addr()))
            .field("subscriptions", &shared.subs.len())
            .field("buffered_bytes", &shared.buffer.active_len())
            .finish_non_exhaustive()
    }
}

// ─── Inner operations (called with and without the lock) ─────────────────────

impl ConnectionInner {
    fn set_status(&self, status: Status) {
        let mut shared = self.shared.lock().unwrap();
        shared.status = status;
        drop(shared);
        let _ = self.status_tx.send(status);
    }

    fn set_last_error(&self, err: &Error) {
        self.shared.lock().unwrap().last_error = Some(err.to_string());
    }

    fn send_event(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Appends a publish to the active (or pending) buffer under the lock and
    /// wakes the flusher. Returns the flush generation of the bytes and
    /// whether they landed in the pending-publish buffer.
    fn publish_bytes(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> Result<(u64, bool)> {
        let appended = {
            let mut shared = self.shared.lock().unwrap();
            match shared.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::DrainingPubs => return Err(Error::Draining),
                _ => {}
            }
            let max = shared.info.max_payload;
            if max > 0 && payload.len() > max {
                return Err(Error::MaxPayload {
                    size: payload.len(),
                    max,
                });
            }
            let mut cmd = Vec::with_capacity(payload.len() + subject.len() + 32);
            protocol::encode_pub(&mut cmd, subject, reply, payload);
            let gen = shared.buffer.append(&cmd)?;
            shared.stats.out_msgs += 1;
            shared.stats.out_bytes += payload.len() as u64;
            (gen, shared.buffer.in_pending_mode())
        };
        self.flush_notify.notify_one();
        Ok(appended)
    }

    /// Blocks until the flusher has written generation `gen` to the socket.
    async fn wait_flushed(&self, gen: u64) -> Result<()> {
        let mut rx = self.flushed_tx.subscribe();
        let _ = rx.wait_for(|flushed| *flushed >= gen).await;
        if self.shared.lock().unwrap().status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Registers a PONG waiter and sends a PING, for `flush`.
    fn register_flush_ping(&self) -> Result<oneshot::Receiver<std::result::Result<(), ()>>> {
        let rx = {
            let mut shared = self.shared.lock().unwrap();
            match shared.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::Reconnecting | Status::Connecting => return Err(Error::Disconnected),
                Status::DrainingPubs => return Err(Error::Draining),
                _ => {}
            }
            let (tx, rx) = oneshot::channel();
            shared.buffer.append(PING_OP)?;
            shared.pong_waiters.push_back(tx);
            rx
        };
        self.flush_notify.notify_one();
        Ok(rx)
    }

    /// Like [`register_flush_ping`] but usable in the draining states.
    fn register_ping_waiter(&self) -> Result<oneshot::Receiver<std::result::Result<(), ()>>> {
        let rx = {
            let mut shared = self.shared.lock().unwrap();
            if shared.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            let (tx, rx) = oneshot::channel();
            shared.buffer.append(PING_OP)?;
            shared.pong_waiters.push_back(tx);
            rx
        };
        self.flush_notify.notify_one();
        Ok(rx)
    }

    /// Creates and registers a subscription; sends SUB when connected.
    fn subscribe_impl(
        self: &Arc<Self>,
        subject: &str,
        queue: Option<&str>,
        handler: Option<MessageHandler>,
        timeout: Option<Duration>,
        prevent_pool: bool,
    ) -> Result<Subscription> {
        protocol::validate_subscribe_subject(subject)?;
        if let Some(queue) = queue {
            protocol::validate_queue_name(queue)?;
        }
        let mode = match &handler {
            None => DeliveryMode::Sync,
            Some(_) if self.opts.use_shared_delivery_pool && !prevent_pool => DeliveryMode::Pool,
            Some(_) => DeliveryMode::Owned,
        };
        if timeout.is_some() && handler.is_none() {
            return Err(Error::IllegalState(
                "subscription timeouts require an asynchronous handler",
            ));
        }

        let sub = {
            let mut shared = self.shared.lock().unwrap();
            match shared.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::DrainingSubs | Status::DrainingPubs => return Err(Error::Draining),
                _ => {}
            }
            let sid = shared.next_sid;
            shared.next_sid += 1;
            let sub = SubInner::new(
                sid,
                subject.to_string(),
                queue.map(str::to_string),
                handler,
                mode,
                timeout,
                Arc::downgrade(self),
                self.opts.sub_pending_msgs_limit,
                self.opts.sub_pending_bytes_limit,
            );
            if timeout.is_some() {
                sub.state.lock().unwrap().idle_since = Some(std::time::Instant::now());
            }
            shared.subs.insert(sid, sub.clone());
            shared.sub_order.push(sid);
            if shared.status == Status::Connected {
                let mut cmd = Vec::with_capacity(subject.len() + 32);
                protocol::encode_sub(&mut cmd, subject, queue, sid);
                shared.buffer.append(&cmd)?;
            }
            sub
        };
        self.flush_notify.notify_one();

        match mode {
            DeliveryMode::Owned => delivery::spawn_owned_dispatcher(&self.runtime, sub.clone()),
            DeliveryMode::Pool | DeliveryMode::Sync => {}
        }
        if let Some(timeout) = sub.timeout {
            delivery::spawn_timeout_timer(&self.runtime, sub.clone(), timeout);
        }
        Ok(Subscription { inner: sub })
    }

    /// UNSUB, immediate or after `max` more deliveries.
    pub(crate) fn unsubscribe(&self, sub: &Arc<SubInner>, max: Option<u64>) -> Result<()> {
        let close_now = {
            let mut shared = self.shared.lock().unwrap();
            if shared.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            if sub.is_closed() {
                return Err(Error::InvalidSubscription);
            }
            let connected = shared.status == Status::Connected;
            match max {
                Some(max) if sub.set_auto_unsub(max) => {
                    if connected {
                        let mut cmd = Vec::with_capacity(32);
                        protocol::encode_unsub(&mut cmd, sub.sid, Some(max));
                        shared.buffer.append(&cmd)?;
                    }
                    None
                }
                // Either a plain unsubscribe, or the auto-unsubscribe limit
                // was already consumed.
                reason => {
                    let sid = sub.sid;
                    shared.subs.remove(&sid);
                    shared.sub_order.retain(|s| *s != sid);
                    if connected {
                        let mut cmd = Vec::with_capacity(16);
                        protocol::encode_unsub(&mut cmd, sid, None);
                        shared.buffer.append(&cmd)?;
                    }
                    Some(if reason.is_some() {
                        CloseReason::MaxDelivered
                    } else {
                        CloseReason::Unsubscribed
                    })
                }
            }
        };
        self.flush_notify.notify_one();
        if let Some(reason) = close_now {
            sub.close(reason);
        }
        Ok(())
    }

    /// Starts draining one subscription: UNSUB now, handler keeps the queued
    /// backlog, close on empty.
    pub(crate) fn drain_subscription(&self, sub: &Arc<SubInner>) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            if sub.is_closed() {
                return Err(Error::InvalidSubscription);
            }
            if shared.status == Status::Connected {
                let mut cmd = Vec::with_capacity(16);
                protocol::encode_unsub(&mut cmd, sub.sid, None);
                shared.buffer.append(&cmd)?;
            }
        }
        self.flush_notify.notify_one();
        sub.start_drain();
        if sub.mode == DeliveryMode::Pool {
            delivery::signal_drain(&self.runtime, sub);
        }
        Ok(())
    }

    pub(crate) fn remove_subscription(&self, sid: u64) {
        let mut shared = self.shared.lock().unwrap();
        shared.subs.remove(&sid);
        shared.sub_order.retain(|s| *s != sid);
    }

    /// Lazily creates the request multiplexer and its shared inbox
    /// subscription. Two racing callers may both build one; the loser
    /// unsubscribes its copy, and either way the returned mux has a live
    /// inbox subscription before any request publishes.
    fn ensure_mux(self: &Arc<Self>) -> Result<Arc<RequestMux>> {
        if let Some(mux) = self.shared.lock().unwrap().mux.clone() {
            return Ok(mux);
        }
        let mux = Arc::new(RequestMux::new(new_inbox()));
        let sub = self.subscribe_impl(&mux.wildcard_subject(), None, Some(mux.make_handler()), None, true)?;
        let mut shared = self.shared.lock().unwrap();
        if let Some(existing) = shared.mux.clone() {
            // Lost the race; drop our subscription.
            drop(shared);
            let _ = sub.unsubscribe();
            return Ok(existing);
        }
        shared.mux = Some(mux.clone());
        Ok(mux)
    }

    /// Flags the connection as draining and issues UNSUB for every
    /// subscription. Returns the subscriptions to drain.
    fn begin_drain(&self) -> Result<Vec<Arc<SubInner>>> {
        let subs = {
            let mut shared = self.shared.lock().unwrap();
            match shared.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::DrainingSubs | Status::DrainingPubs => return Err(Error::Draining),
                Status::Connected => {}
                _ => return Err(Error::IllegalState("drain requires a connected connection")),
            }
            shared.status = Status::DrainingSubs;
            let subs: Vec<Arc<SubInner>> = shared.sub_order.iter()
                .filter_map(|sid| shared.subs.get(sid).cloned())
                .collect();
            for sub in &subs {
                let mut cmd = Vec::with_capacity(16);
                protocol::encode_unsub(&mut cmd, sub.sid, None);
                shared.buffer.append(&cmd)?;
            }
            let mux = shared.mux.clone();
            drop(shared);
            let _ = self.status_tx.send(Status::DrainingSubs);
            if let Some(mux) = mux {
                // Outstanding requests cannot complete once draining starts.
                mux.fail_all();
            }
            subs
        };
        self.flush_notify.notify_one();
        Ok(subs)
    }

    // ── read-loop dispatch ──

    fn dispatch_op(self: &Arc<Self>, op: ServerOp, fail: &mpsc::Sender<Error>) -> Result<()> {
        match op {
            ServerOp::Ping => {
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.buffer.append(PONG_OP)?;
                }
                self.flush_notify.notify_one();
            }
            ServerOp::Pong => {
                let waiter = {
                    let mut shared = self.shared.lock().unwrap();
                    shared.pings_out = 0;
                    shared.pong_waiters.pop_front()
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            ServerOp::Ok => {}
            ServerOp::Err(text) => {
                let err = Error::from_server_err(&text);
                match err {
                    Error::NotPermitted(_) => {
                        // Permission violations affect one subject, not the
                        // connection.
                        self.set_last_error(&err);
                        self.send_event(Event::Error {
                            subject: None,
                            error: err,
                        });
                    }
                    err => return Err(err),
                }
            }
            ServerOp::Info(update) => self.process_async_info(update, fail),
            ServerOp::Msg {
                subject,
                sid,
                reply,
                payload,
            } => self.process_msg(subject, sid, reply, payload),
        }
        Ok(())
    }

    fn process_msg(&self, subject: String, sid: u64, reply: Option<String>, payload: Vec<u8>) {
        let sub = {
            let mut shared = self.shared.lock().unwrap();
            shared.stats.in_msgs += 1;
            shared.stats.in_bytes += payload.len() as u64;
            shared.subs.get(&sid).cloned()
        };
        // Unknown sid: the server raced our UNSUB.
        let Some(sub) = sub else { return };
        match sub.enqueue(Message::new(subject, reply, payload, sid)) {
            Enqueued::Delivered { schedule: true } => delivery::schedule(&self.runtime, sub),
            Enqueued::Delivered { schedule: false } | Enqueued::Ignored => {}
            Enqueued::SlowConsumer { first } => {
                if first {
                    let err = Error::SlowConsumer;
                    self.set_last_error(&err);
                    self.send_event(Event::Error {
                        subject: Some(sub.subject.clone()),
                        error: err,
                    });
                }
            }
        }
    }

    fn process_async_info(self: &Arc<Self>, update: ServerInfo, fail: &mpsc::Sender<Error>) {
        let discovered = {
            let mut shared = self.shared.lock().unwrap();
            let tls = self.opts.tls_required || shared.info.tls_required;
            let added = if update.connect_urls.is_empty() {
                0
            } else {
                shared.pool.merge_discovered(&update.connect_urls, tls)
            };
            if update.max_payload > 0 {
                shared.info.max_payload = update.max_payload;
            }
            added > 0
        };
        if discovered {
            debug!("info: server pool grew from async INFO");
            self.send_event(Event::Discovered);
        }
        if update.lame_duck_mode {
            info!("info: server entered lame-duck mode, evacuating");
            let fail = fail.clone();
            self.runtime.spawn(async move {
                let jitter = rand::thread_rng().gen_range(0..RECONNECT_JITTER.as_millis() as u64);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                let _ = fail.try_send(Error::Disconnected);
            });
        }
    }
}

// ─── Supervisor: connect, run, reconnect, close ──────────────────────────────

/// Tries every endpoint once, in pool order. The initial-connect pass does
/// not sleep between endpoints.
async fn initial_connect(inner: &Arc<ConnectionInner>) -> Result<Established> {
    let mut last_err: Option<Error> = None;
    let count = inner.shared.lock().unwrap().pool.len();
    for _ in 0..count {
        let idx = {
            let mut shared = inner.shared.lock().unwrap();
            match shared.pool.next(Duration::ZERO, -1) {
                Candidate::Ready(idx) => {
                    shared.pool.mark_attempt(idx);
                    idx
                }
                _ => break,
            }
        };
        match establish(inner, idx).await {
            Ok(est) => return Ok(est),
            Err(err) => {
                warn!(err = %err, "connect: endpoint failed");
                inner.shared.lock().unwrap().pool.mark_failed(idx);
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(Error::NoServer))
}

/// The reconnect driver: rotates the pool, sleeping the per-endpoint wait
/// (plus jitter) when it comes around too fast, until a handshake succeeds,
/// the pool is exhausted, or the connection is closed.
async fn reconnect_loop(inner: &Arc<ConnectionInner>) -> Option<Established> {
    loop {
        let candidate = {
            let mut shared = inner.shared.lock().unwrap();
            if shared.close_requested {
                return None;
            }
            shared
                .pool
                .next(inner.opts.reconnect_wait, inner.opts.max_reconnect)
        };
        match candidate {
            Candidate::Exhausted => {
                warn!("reconnect: server pool exhausted");
                return None;
            }
            Candidate::Wait(wait) => {
                let jitter = rand::thread_rng().gen_range(0..RECONNECT_JITTER.as_millis() as u64);
                let sleep = wait + Duration::from_millis(jitter);
                trace!(?sleep, "reconnect: waiting before next attempt");
                let mut close_rx = inner.close_tx.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = close_rx.wait_for(|closed| *closed) => {}
                }
            }
            Candidate::Ready(idx) => {
                inner.shared.lock().unwrap().pool.mark_attempt(idx);
                match establish(inner, idx).await {
                    Ok(est) => return Some(est),
                    Err(err) => {
                        debug!(err = %err, "reconnect: attempt failed");
                        inner.set_last_error(&err);
                        inner.shared.lock().unwrap().pool.mark_failed(idx);
                        if matches!(err, Error::AuthFailed(_)) {
                            inner.send_event(Event::Error {
                                subject: None,
                                error: err,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Full handshake against one endpoint, bounded by the connect timeout:
/// TCP (with address-family preference), INFO, optional TLS upgrade,
/// CONNECT + PING, wait for PONG.
async fn establish(inner: &Arc<ConnectionInner>, idx: usize) -> Result<Established> {
    let endpoint = {
        let shared = inner.shared.lock().unwrap();
        shared.pool.get(idx).cloned().ok_or(Error::NoServer)?
    };
    let opts = &inner.opts;
    debug!(server = %endpoint.addr(), "connect: starting handshake");

    let handshake = async {
        let tcp = socket::open_tcp(&endpoint.host, endpoint.port, opts.ip_family).await?;
        let mut reader = LineReader::new(Stream::Tcp(tcp));

        let line = reader.read_line().await?;
        let info = match line.strip_prefix(b"INFO ") {
            Some(body) => ServerInfo::parse(body)?,
            None => {
                return Err(Error::Protocol(format!(
                    "expected INFO, got {:?}",
                    String::from_utf8_lossy(&line[..line.len().min(32)])
                )))
            }
        };

        // TLS negotiation.
        let want_tls = opts.tls_required || endpoint.tls_scheme;
        if want_tls && !info.tls_required {
            return Err(Error::SecureWanted);
        }
        if (want_tls || info.tls_required) && opts.tls_config.is_none() {
            return Err(Error::SecureRequired);
        }
        let mut reader = if want_tls || info.tls_required {
            let (stream, leftover) = reader.into_parts();
            if !leftover.is_empty() {
                return Err(Error::Protocol("unexpected bytes before TLS handshake".into()));
            }
            let Stream::Tcp(tcp) = stream else {
                return Err(Error::Ssl("connection is already encrypted".into()));
            };
            let config = opts.tls_config.clone().expect("checked above");
            let hostname = opts.tls_hostname.as_deref().unwrap_or(&endpoint.host);
            LineReader::new(socket::upgrade_tls(tcp, config, hostname).await?)
        } else {
            reader
        };

        if opts.no_echo && info.proto < 1 {
            return Err(Error::NoServerSupport("echo suppression"));
        }

        let connect = build_connect(opts, &endpoint, &info)?;
        let mut first_bytes = connect.encode()?;
        first_bytes.extend_from_slice(PING_OP);
        reader.stream.write_all(&first_bytes).await?;
        reader.stream.flush().await?;

        // The server answers PONG, possibly preceded by +OK (verbose) or a
        // fresh INFO; -ERR ends the attempt.
        let mut info = info;
        loop {
            let line = reader.read_line().await?;
            if line.eq_ignore_ascii_case(b"PONG") {
                break;
            }
            if line == b"+OK" {
                continue;
            }
            if let Some(body) = line.strip_prefix(b"INFO ") {
                info = ServerInfo::parse(body)?;
                continue;
            }
            if let Some(rest) = line.strip_prefix(b"-ERR") {
                let text = String::from_utf8_lossy(rest);
                return Err(Error::from_server_err(text.trim().trim_matches('\'')));
            }
            return Err(Error::Protocol(format!(
                "unexpected handshake line: {:?}",
                String::from_utf8_lossy(&line[..line.len().min(32)])
            )));
        }

        let (stream, leftover) = reader.into_parts();
        Ok(Established {
            stream,
            leftover,
            idx,
            info,
        })
    };

    match tokio::time::timeout(opts.connect_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(opts.connect_timeout)),
    }
}

/// Builds the CONNECT body with credential precedence: JWT > NKey > token >
/// user/password. URL-embedded credentials override the option fields.
fn build_connect(
    opts: &Options,
    endpoint: &crate::servers::Endpoint,
    info: &ServerInfo,
) -> Result<ConnectInfo> {
    let mut connect = ConnectInfo {
        verbose: opts.verbose,
        pedantic: opts.pedantic,
        tls_required: opts.tls_required || endpoint.tls_scheme,
        name: opts.name.clone(),
        lang: CLIENT_LANG,
        version: CLIENT_VERSION,
        protocol: 1,
        echo: !opts.no_echo,
        user: None,
        pass: None,
        auth_token: None,
        jwt: None,
        nkey: None,
        sig: None,
    };

    let sign = |signer: &crate::options::NonceSigner| -> Result<Option<String>> {
        match &info.nonce {
            Some(nonce) => {
                let sig = signer(nonce.as_bytes())?;
                Ok(Some(auth::base64_raw_url(&sig)))
            }
            None => Ok(None),
        }
    };

    if let (Some(jwt_provider), Some(signer)) = (&opts.jwt_provider, &opts.signer) {
        connect.jwt = Some(jwt_provider()?);
        connect.sig = sign(signer)?;
    } else if let (Some(nkey), Some(signer)) = (&opts.nkey, &opts.signer) {
        connect.nkey = Some(nkey.clone());
        connect.sig = sign(signer)?;
    } else if let Some(provider) = &opts.token_provider {
        connect.auth_token = Some(provider());
    } else if let Some(token) = &opts.token {
        connect.auth_token = Some(token.clone());
    } else if endpoint.username.is_some() {
        if endpoint.password.is_some() {
            connect.user = endpoint.username.clone();
            connect.pass = endpoint.password.clone();
        } else {
            // A lone URL userinfo token is an auth token.
            connect.auth_token = endpoint.username.clone();
        }
    } else if opts.user.is_some() {
        connect.user = opts.user.clone();
        connect.pass = opts.password.clone();
    }
    Ok(connect)
}

/// Supervisor task: runs the connected phase, then reconnects (when allowed)
/// until close or pool exhaustion.
async fn conn_loop(inner: Arc<ConnectionInner>, mut established: Option<Established>) {
    loop {
        let est = match established.take() {
            Some(est) => est,
            None => match reconnect_loop(&inner).await {
                Some(est) => est,
                None => break,
            },
        };
        match run_connected(&inner, est).await {
            RunEnd::CloseRequested => break,
            RunEnd::Failed(err) => {
                let allow = inner.opts.allow_reconnect
                    && !inner.shared.lock().unwrap().close_requested;
                warn!(err = %err, reconnecting = allow, "connection: lost");
                handle_disconnect(&inner, &err, allow);
                if !allow {
                    break;
                }
            }
        }
    }
    do_close(&inner);
}

/// Applies a successful handshake and babysits the per-socket tasks until
/// one fails or close is requested.
async fn run_connected(inner: &Arc<ConnectionInner>, est: Established) -> RunEnd {
    let Established {
        stream,
        leftover,
        idx,
        info,
    } = est;
    let (read_half, write_half) = tokio::io::split(stream);

    let server = info.server_id.clone();
    let event = {
        let mut shared = inner.shared.lock().unwrap();
        let was_reconnect = shared.status == Status::Reconnecting;
        shared.status = Status::Connected;
        shared.pool.mark_connected(idx);
        shared.current = Some(idx);
        shared.info = info;
        shared.pings_out = 0;

        // Re-establish interest in insertion order, then replay the
        // pending-publish buffer, before any new publish gets in.
        let mut resub = Vec::new();
        for sid in shared.sub_order.clone() {
            let Some(sub) = shared.subs.get(&sid) else { continue };
            let Some(remaining) = sub.resub_snapshot() else { continue };
            protocol::encode_sub(&mut resub, &sub.subject, sub.queue_group.as_deref(), sid);
            if let Some(remaining) = remaining {
                protocol::encode_unsub(&mut resub, sid, Some(remaining));
            }
        }
        let pending = shared.buffer.take_pending();
        // Infallible: the buffer just left pending mode.
        let _ = shared.buffer.append(&resub);
        let _ = shared.buffer.append(&pending);

        let event = if was_reconnect {
            if shared.ever_connected {
                shared.stats.reconnects += 1;
                Some(Event::Reconnected)
            } else {
                Some(Event::ConnectedRetry)
            }
        } else {
            None
        };
        shared.ever_connected = true;
        event
    };
    let _ = inner.status_tx.send(Status::Connected);
    info!(server = %server, "connection: connected");
    if let Some(event) = event {
        inner.send_event(event);
    }
    inner.flush_notify.notify_one();

    let (fail_tx, mut fail_rx) = mpsc::channel::<Error>(4);
    let tasks: Vec<JoinHandle<()>> = vec![
        inner
            .runtime
            .spawn(read_loop(inner.clone(), read_half, leftover, fail_tx.clone())),
        inner
            .runtime
            .spawn(flusher(inner.clone(), write_half, fail_tx.clone())),
        inner.runtime.spawn(ping_timer(inner.clone(), fail_tx)),
    ];

    let mut close_rx = inner.close_tx.subscribe();
    let end = loop {
        if *close_rx.borrow_and_update() {
            break RunEnd::CloseRequested;
        }
        tokio::select! {
            _ = close_rx.changed() => continue,
            failed = fail_rx.recv() => {
                break RunEnd::Failed(failed.unwrap_or(Error::Disconnected));
            }
        }
    };
    for task in tasks {
        task.abort();
    }
    end
}

/// Transition into the reconnect window (or towards close).
fn handle_disconnect(inner: &Arc<ConnectionInner>, err: &Error, will_reconnect: bool) {
    let (waiters, appended) = {
        let mut shared = inner.shared.lock().unwrap();
        shared.current = None;
        shared.pings_out = 0;
        shared.last_error = Some(err.to_string());
        if will_reconnect {
            shared.status = Status::Reconnecting;
            shared.buffer.enter_pending();
            debug!(
                carried = shared.buffer.pending_len(),
                "connection: switched writes to the pending buffer"
            );
        }
        (
            std::mem::take(&mut shared.pong_waiters),
            shared.buffer.appended_gen(),
        )
    };
    if will_reconnect {
        let _ = inner.status_tx.send(Status::Reconnecting);
    }
    // Anything appended before the disconnect has either hit the socket or
    // is lost with it; release send-asap waiters either way.
    inner.flushed_tx.send_if_modified(|current| {
        if appended > *current {
            *current = appended;
            true
        } else {
            false
        }
    });
    // Flush callers cannot know whether their publishes arrived.
    for waiter in waiters {
        let _ = waiter.send(Err(()));
    }
    inner.send_event(Event::Disconnected);
}

/// Final teardown; idempotent. Fires the closed callback exactly once.
fn do_close(inner: &Arc<ConnectionInner>) {
    let (subs, waiters, mux) = {
        let mut shared = inner.shared.lock().unwrap();
        if shared.status == Status::Closed {
            return;
        }
        shared.status = Status::Closed;
        shared.current = None;
        shared.sub_order.clear();
        (
            std::mem::take(&mut shared.subs),
            std::mem::take(&mut shared.pong_waiters),
            shared.mux.clone(),
        )
    };
    let _ = inner.status_tx.send(Status::Closed);
    // Release anything blocked on the flusher watermark.
    let _ = inner.flushed_tx.send(u64::MAX);
    for sub in subs.into_values() {
        sub.close(CloseReason::ConnectionClosed);
    }
    for waiter in waiters {
        let _ = waiter.send(Err(()));
    }
    if let Some(mux) = mux {
        mux.fail_all();
    }
    info!("connection: closed");
    inner.send_event(Event::Closed);
}

// ─── Per-socket tasks ────────────────────────────────────────────────────────

/// Sole owner of the read half and the parser.
async fn read_loop(
    inner: Arc<ConnectionInner>,
    mut read_half: ReadHalf<Stream>,
    leftover: Vec<u8>,
    fail: mpsc::Sender<Error>,
) {
    let mut parser = Parser::new();
    let mut ops: Vec<ServerOp> = Vec::new();
    let run = async {
        if !leftover.is_empty() {
            parser.parse(&leftover, &mut ops)?;
            for op in ops.drain(..) {
                inner.dispatch_op(op, &fail)?;
            }
        }
        let mut buf = vec![0u8; inner.opts.io_buf_size.max(512)];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            trace!(bytes = n, "read loop: received");
            parser.parse(&buf[..n], &mut ops)?;
            for op in ops.drain(..) {
                inner.dispatch_op(op, &fail)?;
            }
        }
    };
    let result: Result<()> = run.await;
    if let Err(err) = result {
        let _ = fail.try_send(err);
    }
}

/// Sole writer to the socket. Woken by appends; drains the whole buffer per
/// wakeup and publishes the flushed-generation watermark.
async fn flusher(
    inner: Arc<ConnectionInner>,
    mut write_half: WriteHalf<Stream>,
    fail: mpsc::Sender<Error>,
) {
    let run = async {
        loop {
            let notified = inner.flush_notify.notified();
            let (bytes, watermark) = {
                let mut shared = inner.shared.lock().unwrap();
                shared.buffer.take_active()
            };
            if bytes.is_empty() {
                notified.await;
                continue;
            }
            trace!(bytes = bytes.len(), "flusher: writing");
            match inner.opts.write_deadline {
                Some(deadline) => {
                    tokio::time::timeout(deadline, write_half.write_all(&bytes))
                        .await
                        .map_err(|_| {
                            Error::Io(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "write deadline exceeded",
                            ))
                        })??;
                }
                None => write_half.write_all(&bytes).await?,
            }
            write_half.flush().await?;
            inner.flushed_tx.send_if_modified(|current| {
                if watermark > *current {
                    *current = watermark;
                    true
                } else {
                    false
                }
            });
        }
    };
    let result: Result<()> = run.await;
    if let Err(err) = result {
        let _ = fail.try_send(err);
    }
}

/// Sends PING every interval; declares the connection stale once too many go
/// unanswered.
async fn ping_timer(inner: Arc<ConnectionInner>, fail: mpsc::Sender<Error>) {
    let interval = inner.opts.ping_interval;
    if interval.is_zero() {
        return;
    }
    loop {
        tokio::time::sleep(interval).await;
        let outstanding = {
            let mut shared = inner.shared.lock().unwrap();
            if shared.status != Status::Connected {
                return;
            }
            shared.pings_out += 1;
            shared.pings_out
        };
        if outstanding > inner.opts.max_pings_out {
            warn!(outstanding, "ping timer: no PONG from server, connection is stale");
            let _ = fail.try_send(Error::StaleConnection);
            return;
        }
        {
            let mut shared = inner.shared.lock().unwrap();
            if shared.buffer.append(PING_OP).is_err() {
                continue;
            }
        }
        inner.flush_notify.notify_one();
    }
}

/// Serializes user callbacks so closed/disconnected/reconnected/discovered
/// notifications preserve observable order, outside every lock.
fn spawn_callback_worker(
    runtime: &Handle,
    mut events: mpsc::UnboundedReceiver<Event>,
    weak: Weak<ConnectionInner>,
) {
    runtime.spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            let conn = Connection { inner };
            let opts = &conn.inner.opts;
            match event {
                Event::Closed => {
                    if let Some(cb) = &opts.closed_callback {
                        cb(&conn);
                    }
                }
                Event::Disconnected => {
                    if let Some(cb) = &opts.disconnected_callback {
                        cb(&conn);
                    }
                }
                Event::Reconnected => {
                    if let Some(cb) = &opts.reconnected_callback {
                        cb(&conn);
                    }
                }
                Event::Discovered => {
                    if let Some(cb) = &opts.discovered_callback {
                        cb(&conn);
                    }
                }
                Event::ConnectedRetry => {
                    if let Some(cb) = &opts.connected_callback {
                        cb(&conn);
                    }
                }
                Event::Error { subject, error } => {
                    if let Some(cb) = &opts.error_callback {
                        cb(subject, error);
                    }
                }
            }
        }
    });
}

// ─── Handshake line reader ───────────────────────────────────────────────────

/// Minimal CRLF line reader for the handshake, before the socket is split
/// and handed to the parser. Keeps over-read bytes for the read loop.
struct LineReader {
    stream: Stream,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self
                .buf
                .windows(2)
                .position(|pair| pair == b"\r\n")
            {
                let mut line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                line.truncate(pos);
                return Ok(line);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn into_parts(self) -> (Stream, Vec<u8>) {
        (self.stream, self.buf)
    }
}
