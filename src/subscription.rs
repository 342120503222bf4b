// SPDX-License-Identifier: MIT
//! Subscriptions and their pending-message queues.
//!
//! Each subscription owns a bounded queue guarded by its own lock and
//! condition so delivery never contends on the connection lock. The read loop
//! enqueues, and exactly one consumer dequeues: the caller of
//! [`Subscription::next_msg`] for synchronous subscriptions, or a delivery
//! worker (owned task or shared-pool worker) for asynchronous ones.
//!
//! Queue limits are enforced on enqueue: a message that would exceed either
//! the message or byte limit is dropped, the subscription is flagged a slow
//! consumer, and the connection's asynchronous error callback is told,
//! without affecting the connection or other subscriptions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::connection::ConnectionInner;
use crate::errors::{Error, Result};
use crate::message::Message;
use crate::options::MessageHandler;

/// How messages leave the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryMode {
    /// No callback; the user pulls with `next_msg`.
    Sync,
    /// Dedicated dispatcher task, strictly FIFO.
    Owned,
    /// Shared worker pool, `sid`-affine for per-subscription FIFO.
    Pool,
}

/// Why a subscription stopped accepting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Unsubscribed,
    MaxDelivered,
    Drained,
    ConnectionClosed,
}

impl CloseReason {
    pub(crate) fn as_error(self) -> Error {
        match self {
            CloseReason::MaxDelivered => Error::MaxDelivered,
            CloseReason::ConnectionClosed => Error::ConnectionClosed,
            CloseReason::Unsubscribed | CloseReason::Drained => Error::InvalidSubscription,
        }
    }
}

/// Entry in the pending queue. `TimedOut` is a control marker injected by the
/// subscription-timeout timer so the timeout notification stays ordered with
/// message deliveries.
#[derive(Debug)]
pub(crate) enum SubItem {
    Msg(Message),
    TimedOut,
}

/// Outcome of an enqueue attempt, reported to the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    /// Accepted. `schedule` asks the read loop to hand the subscription to
    /// its shared-pool worker.
    Delivered { schedule: bool },
    /// Dropped over a queue limit. `first` marks the transition into the
    /// slow-consumer state and gates the error callback.
    SlowConsumer { first: bool },
    /// Closed, draining past UNSUB, or past the auto-unsubscribe limit.
    Ignored,
}

#[derive(Debug)]
pub(crate) struct SubState {
    items: VecDeque<SubItem>,
    queued_msgs: usize,
    queued_bytes: usize,
    pub(crate) pending_msgs_limit: usize,
    pub(crate) pending_bytes_limit: usize,
    /// Messages accepted from the wire (enqueued), including later drops by
    /// the delivery side.
    received: u64,
    delivered: u64,
    dropped: u64,
    /// High-water marks since creation or the last `clear_max_pending`.
    max_queued_msgs: usize,
    max_queued_bytes: usize,
    auto_unsub_max: Option<u64>,
    slow_consumer: bool,
    pub(crate) closed: Option<CloseReason>,
    pub(crate) draining: bool,
    /// Pool mode: subscription is queued at (or being drained by) its worker.
    pub(crate) scheduled: bool,
    /// Start of the current idle window; drives the subscription timeout.
    pub(crate) idle_since: Option<Instant>,
    /// The timeout already fired for the current idle window.
    pub(crate) timeout_fired: bool,
}

/// Shared state of one subscription.
pub(crate) struct SubInner {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) handler: Option<MessageHandler>,
    pub(crate) mode: DeliveryMode,
    /// Async-only: invoke the handler with `None` after this much idle time.
    pub(crate) timeout: Option<Duration>,
    /// Non-owning back-reference; breaks the connection↔subscription cycle.
    pub(crate) conn: Weak<ConnectionInner>,
    pub(crate) state: Mutex<SubState>,
    /// Wakes `next_msg` callers, the owned dispatcher, and drain waiters.
    pub(crate) notify: Notify,
}

impl std::fmt::Debug for SubInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubInner")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SubInner {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        handler: Option<MessageHandler>,
        mode: DeliveryMode,
        timeout: Option<Duration>,
        conn: Weak<ConnectionInner>,
        pending_msgs_limit: usize,
        pending_bytes_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid,
            subject,
            queue_group,
            handler,
            mode,
            timeout,
            conn,
            state: Mutex::new(SubState {
                items: VecDeque::new(),
                queued_msgs: 0,
                queued_bytes: 0,
                pending_msgs_limit,
                pending_bytes_limit,
                received: 0,
                delivered: 0,
                dropped: 0,
                max_queued_msgs: 0,
                max_queued_bytes: 0,
                auto_unsub_max: None,
                slow_consumer: false,
                closed: None,
                draining: false,
                scheduled: false,
                idle_since: None,
                timeout_fired: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Called by the read loop for every matching MSG.
    pub(crate) fn enqueue(&self, msg: Message) -> Enqueued {
        let mut st = self.state.lock().unwrap();
        if st.closed.is_some() {
            return Enqueued::Ignored;
        }
        if let Some(max) = st.auto_unsub_max {
            // The server can race our UNSUB <max>; extras are dropped here.
            if st.received >= max {
                return Enqueued::Ignored;
            }
        }
        st.received += 1;

        let len = msg.payload.len();
        if st.queued_msgs + 1 > st.pending_msgs_limit
            || st.queued_bytes + len > st.pending_bytes_limit
        {
            st.dropped += 1;
            let first = !st.slow_consumer;
            st.slow_consumer = true;
            return Enqueued::SlowConsumer { first };
        }
        st.slow_consumer = false;
        st.items.push_back(SubItem::Msg(msg));
        st.queued_msgs += 1;
        st.queued_bytes += len;
        st.max_queued_msgs = st.max_queued_msgs.max(st.queued_msgs);
        st.max_queued_bytes = st.max_queued_bytes.max(st.queued_bytes);
        st.idle_since = None;
        st.timeout_fired = false;

        let schedule = if self.mode == DeliveryMode::Pool && !st.scheduled {
            st.scheduled = true;
            true
        } else {
            false
        };
        drop(st);
        self.notify.notify_one();
        Enqueued::Delivered { schedule }
    }

    /// Injects the timeout marker for the current idle window.
    pub(crate) fn enqueue_timeout_marker(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.closed.is_some() || st.timeout_fired || st.idle_since.is_none() {
            return false;
        }
        st.timeout_fired = true;
        st.items.push_back(SubItem::TimedOut);
        let schedule = if self.mode == DeliveryMode::Pool && !st.scheduled {
            st.scheduled = true;
            true
        } else {
            false
        };
        drop(st);
        self.notify.notify_one();
        schedule
    }

    /// Dequeues the next item for delivery, counting delivered messages.
    /// Returns the item plus `true` when this delivery reaches the
    /// auto-unsubscribe limit.
    pub(crate) fn pop_for_delivery(&self) -> Option<(SubItem, bool)> {
        let mut st = self.state.lock().unwrap();
        let item = st.items.pop_front()?;
        let mut exhausted = false;
        if let SubItem::Msg(msg) = &item {
            st.queued_msgs -= 1;
            st.queued_bytes -= msg.payload.len();
            st.delivered += 1;
            exhausted = st.auto_unsub_max.is_some_and(|max| st.delivered >= max);
        }
        Some((item, exhausted))
    }

    /// Delivery-side bookkeeping after a handler returns: opens the idle
    /// window for the subscription timeout and reports whether a drain just
    /// completed.
    pub(crate) fn after_delivery(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.items.is_empty() {
            st.idle_since = Some(Instant::now());
            if st.draining && st.closed.is_none() {
                return true;
            }
        }
        false
    }

    /// Pool mode: called by the worker once it drained the queue. Re-checks
    /// emptiness under the lock so a concurrent enqueue is not lost.
    /// Returns `false` if the worker must keep going.
    pub(crate) fn unschedule_if_empty(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.items.is_empty() {
            st.scheduled = false;
            true
        } else {
            false
        }
    }

    /// Marks the subscription closed. Idempotent; the first reason wins.
    pub(crate) fn close(&self, reason: CloseReason) {
        let mut st = self.state.lock().unwrap();
        if st.closed.is_none() {
            st.closed = Some(reason);
        }
        drop(st);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed.is_some()
    }

    pub(crate) fn set_auto_unsub(&self, max: u64) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.delivered >= max {
            return false;
        }
        st.auto_unsub_max = Some(max);
        true
    }

    /// What a reconnect must replay for this subscription: `None` to skip it
    /// entirely (closed, draining, or exhausted), `Some(None)` for a plain
    /// SUB, `Some(Some(n))` for SUB plus UNSUB with `n` deliveries left.
    pub(crate) fn resub_snapshot(&self) -> Option<Option<u64>> {
        let st = self.state.lock().unwrap();
        if st.closed.is_some() || st.draining {
            return None;
        }
        match st.auto_unsub_max {
            None => Some(None),
            Some(max) => {
                let remaining = max.saturating_sub(st.delivered);
                if remaining == 0 {
                    None
                } else {
                    Some(Some(remaining))
                }
            }
        }
    }

    /// `true` when a drain is in progress and nothing is queued, i.e. the
    /// subscription can be finished immediately.
    pub(crate) fn drained_empty(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.closed.is_none() && st.draining && st.items.is_empty()
    }

    pub(crate) fn start_drain(&self) {
        let mut st = self.state.lock().unwrap();
        st.draining = true;
        let empty = st.items.is_empty();
        drop(st);
        if empty {
            // Nothing queued: the drain completes as soon as a waiter or
            // worker observes the flag.
            self.notify.notify_one();
        }
    }
}

/// Handle to an active subscription. Clones share the same subscription.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub(crate) inner: Arc<SubInner>,
}

impl Subscription {
    /// Subscription id, unique for the lifetime of the connection.
    pub fn id(&self) -> u64 {
        self.inner.sid
    }

    /// Subject this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// Queue group, when this is a queue subscription.
    pub fn queue_group(&self) -> Option<&str> {
        self.inner.queue_group.as_deref()
    }

    /// `true` until the subscription is unsubscribed, drained, exhausted by
    /// auto-unsubscribe, or its connection closes.
    pub fn is_valid(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Waits for the next message on a synchronous subscription.
    ///
    /// `timeout` of `None` waits indefinitely; a zero timeout is rejected
    /// with `InvalidTimeout`. Returns `MaxDelivered` once an
    /// auto-unsubscribe limit has been consumed, `ConnectionClosed` after the
    /// connection goes away.
    pub async fn next_msg(&self, timeout: Option<Duration>) -> Result<Message> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidTimeout);
        }
        if self.inner.handler.is_some() {
            return Err(Error::IllegalState("next_msg on an asynchronous subscription"));
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // Register interest before checking so an enqueue between the
            // check and the await leaves a stored permit.
            let notified = self.inner.notify.notified();
            {
                let st = self.inner.state.lock().unwrap();
                if let Some(reason) = st.closed {
                    return Err(reason.as_error());
                }
                let empty = st.items.is_empty();
                let draining = st.draining;
                drop(st);
                if !empty {
                    if let Some((SubItem::Msg(msg), exhausted)) = self.inner.pop_for_delivery() {
                        let drained = self.inner.after_delivery();
                        if exhausted {
                            self.finish(CloseReason::MaxDelivered);
                        } else if drained {
                            self.finish(CloseReason::Drained);
                        }
                        return Ok(msg);
                    }
                    continue; // a stray timeout marker; sync subs skip them
                }
                if draining {
                    self.finish(CloseReason::Drained);
                    return Err(Error::InvalidSubscription);
                }
            }
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return Err(Error::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Removes interest. The server is told to stop sending and the
    /// subscription becomes invalid.
    pub fn unsubscribe(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.unsubscribe(&self.inner, None)
    }

    /// Lets `max` more messages arrive, then removes interest automatically.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        let conn = self.connection()?;
        conn.unsubscribe(&self.inner, Some(max))
    }

    /// Stops new deliveries at the server, lets the queued backlog flow
    /// through the consumer, then invalidates the subscription.
    pub fn drain(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.drain_subscription(&self.inner)
    }

    /// Blocks until a drain started with [`drain`](Self::drain) finishes.
    pub async fn wait_for_drain_completion(&self, timeout: Option<Duration>) -> Result<()> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidTimeout);
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.inner.notify.notified();
            {
                let st = self.inner.state.lock().unwrap();
                if st.closed.is_some() {
                    return Ok(());
                }
                if !st.draining {
                    return Err(Error::IllegalState("subscription is not draining"));
                }
            }
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return Err(Error::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Queued (not yet delivered) messages and bytes.
    pub fn pending(&self) -> (usize, usize) {
        let st = self.inner.state.lock().unwrap();
        (st.queued_msgs, st.queued_bytes)
    }

    /// High-water marks of the pending queue.
    pub fn max_pending(&self) -> (usize, usize) {
        let st = self.inner.state.lock().unwrap();
        (st.max_queued_msgs, st.max_queued_bytes)
    }

    /// Resets the high-water marks.
    pub fn clear_max_pending(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.max_queued_msgs = st.queued_msgs;
        st.max_queued_bytes = st.queued_bytes;
    }

    /// Messages handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.inner.state.lock().unwrap().delivered
    }

    /// Messages dropped over the queue limits.
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().unwrap().dropped
    }

    /// Adjusts the pending limits. Fails on zero limits or a closed
    /// subscription.
    pub fn set_pending_limits(&self, msgs: usize, bytes: usize) -> Result<()> {
        if msgs == 0 || bytes == 0 {
            return Err(Error::InvalidArg("pending limits must be non-zero"));
        }
        let mut st = self.inner.state.lock().unwrap();
        if st.closed.is_some() {
            return Err(Error::InvalidSubscription);
        }
        st.pending_msgs_limit = msgs;
        st.pending_bytes_limit = bytes;
        Ok(())
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.inner.conn.upgrade().ok_or(Error::ConnectionClosed)
    }

    /// Unregisters from the connection (if still alive) and closes with the
    /// given reason.
    pub(crate) fn finish(&self, reason: CloseReason) {
        if let Some(conn) = self.inner.conn.upgrade() {
            conn.remove_subscription(self.inner.sid);
        }
        self.inner.close(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sub(mode: DeliveryMode, msg_limit: usize, byte_limit: usize) -> Arc<SubInner> {
        SubInner::new(
            1,
            "test".into(),
            None,
            None,
            mode,
            None,
            Weak::new(),
            msg_limit,
            byte_limit,
        )
    }

    fn msg(len: usize) -> Message {
        Message::new("test".into(), None, vec![0u8; len], 1)
    }

    #[test]
    fn enqueue_respects_message_limit() {
        let sub = test_sub(DeliveryMode::Sync, 2, 1024);
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::Delivered { schedule: false }
        ));
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::Delivered { schedule: false }
        ));
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::SlowConsumer { first: true }
        ));
        // Still over the limit: dropped again, but no longer the first time.
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::SlowConsumer { first: false }
        ));
        assert_eq!(sub.state.lock().unwrap().dropped, 2);
    }

    #[test]
    fn enqueue_respects_byte_limit() {
        let sub = test_sub(DeliveryMode::Sync, 1024, 10);
        assert!(matches!(sub.enqueue(msg(8)), Enqueued::Delivered { .. }));
        assert!(matches!(
            sub.enqueue(msg(8)),
            Enqueued::SlowConsumer { first: true }
        ));
        let (queued, bytes) = {
            let st = sub.state.lock().unwrap();
            (st.queued_msgs, st.queued_bytes)
        };
        assert_eq!((queued, bytes), (1, 8));
    }

    #[test]
    fn slow_consumer_rearms_after_recovery() {
        let sub = test_sub(DeliveryMode::Sync, 1, 1024);
        sub.enqueue(msg(1));
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::SlowConsumer { first: true }
        ));
        // Consumer catches up.
        sub.pop_for_delivery();
        assert!(matches!(sub.enqueue(msg(1)), Enqueued::Delivered { .. }));
        // Next overflow is a fresh transition.
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::SlowConsumer { first: true }
        ));
    }

    #[test]
    fn auto_unsub_ignores_racing_messages() {
        let sub = test_sub(DeliveryMode::Sync, 16, 1024);
        assert!(sub.set_auto_unsub(2));
        assert!(matches!(sub.enqueue(msg(1)), Enqueued::Delivered { .. }));
        assert!(matches!(sub.enqueue(msg(1)), Enqueued::Delivered { .. }));
        assert!(matches!(sub.enqueue(msg(1)), Enqueued::Ignored));
    }

    #[test]
    fn pop_reports_auto_unsub_exhaustion() {
        let sub = test_sub(DeliveryMode::Sync, 16, 1024);
        sub.set_auto_unsub(2);
        sub.enqueue(msg(1));
        sub.enqueue(msg(1));
        let (_, exhausted) = sub.pop_for_delivery().unwrap();
        assert!(!exhausted);
        let (_, exhausted) = sub.pop_for_delivery().unwrap();
        assert!(exhausted);
    }

    #[tokio::test]
    async fn next_msg_times_out() {
        let sub = Subscription {
            inner: test_sub(DeliveryMode::Sync, 16, 1024),
        };
        let err = sub
            .next_msg(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn next_msg_returns_queued_message() {
        let sub = Subscription {
            inner: test_sub(DeliveryMode::Sync, 16, 1024),
        };
        sub.inner
            .enqueue(Message::new("test".into(), None, b"hello".to_vec(), 1));
        let msg = sub.next_msg(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn next_msg_wakes_on_close() {
        let sub = Subscription {
            inner: test_sub(DeliveryMode::Sync, 16, 1024),
        };
        let waiter = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.next_msg(None).await })
        };
        tokio::task::yield_now().await;
        sub.inner.close(CloseReason::ConnectionClosed);
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("next_msg must wake on close")
            .unwrap();
        assert!(matches!(res, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn pool_mode_schedules_once() {
        let sub = test_sub(DeliveryMode::Pool, 16, 1024);
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::Delivered { schedule: true }
        ));
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::Delivered { schedule: false }
        ));
        // Worker drains both, then unschedules.
        sub.pop_for_delivery();
        sub.pop_for_delivery();
        assert!(sub.unschedule_if_empty());
        assert!(matches!(
            sub.enqueue(msg(1)),
            Enqueued::Delivered { schedule: true }
        ));
    }
}
