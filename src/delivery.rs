//! Message delivery to user handlers.
//!
//! Two modes, chosen per connection at subscribe time:
//!
//! - **Owned dispatcher**: one task per subscription, strictly FIFO.
//! - **Shared pool**: a fixed, process-wide set of worker tasks, lazily
//!   spawned on first use onto the runtime of the connection that needed
//!   them. Each subscription is pinned to the worker at `sid % workers`, so
//!   per-subscription ordering is preserved while the number of workers
//!   stays constant no matter how many subscriptions exist. Workers live
//!   until that runtime shuts down.
//!
//! Handlers run on the delivery worker only; a slow handler never blocks the
//! connection's read loop, just its own subscription (and, in pool mode, the
//! other subscriptions pinned to the same worker).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::subscription::{CloseReason, SubInner, SubItem, Subscription};

/// Default number of shared-pool workers; see [`set_delivery_pool_size`].
const DEFAULT_POOL_SIZE: usize = 1;

static POOL: OnceCell<SharedPool> = OnceCell::new();
static POOL_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_POOL_SIZE);

/// Configures how many workers the process-wide delivery pool starts with.
///
/// Takes effect only before the first pool-mode subscription; afterwards the
/// pool is already running and the call is ignored (returning `false`).
pub fn set_delivery_pool_size(workers: usize) -> bool {
    if workers == 0 || POOL.get().is_some() {
        return false;
    }
    POOL_SIZE.store(workers, Ordering::SeqCst);
    POOL.get().is_none()
}

struct SharedPool {
    senders: Vec<mpsc::UnboundedSender<Arc<SubInner>>>,
}

fn pool(runtime: &Handle) -> &'static SharedPool {
    POOL.get_or_init(|| {
        let workers = POOL_SIZE.load(Ordering::SeqCst);
        debug!(workers, "delivery: starting shared pool");
        let mut senders = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel::<Arc<SubInner>>();
            runtime.spawn(pool_worker(rx));
            senders.push(tx);
        }
        SharedPool { senders }
    })
}

/// Hands a subscription with queued work to its pinned worker.
pub(crate) fn schedule(runtime: &Handle, sub: Arc<SubInner>) {
    let pool = pool(runtime);
    let idx = (sub.sid as usize) % pool.senders.len();
    if pool.senders[idx].send(sub).is_err() {
        warn!("delivery: pool worker is gone, message stays queued");
    }
}

async fn pool_worker(mut rx: mpsc::UnboundedReceiver<Arc<SubInner>>) {
    while let Some(sub) = rx.recv().await {
        service_subscription(&sub);
    }
}

/// Drains one subscription's queue, invoking its handler per item, until the
/// queue is observed empty under the lock (so a racing enqueue re-schedules
/// instead of getting lost).
fn service_subscription(sub: &Arc<SubInner>) {
    let Some(handler) = sub.handler.clone() else {
        return;
    };
    loop {
        match sub.pop_for_delivery() {
            Some((SubItem::Msg(msg), exhausted)) => {
                trace!(sid = sub.sid, subject = %msg.subject, "delivery: dispatching");
                handler(Some(msg));
                let drained = sub.after_delivery();
                if exhausted {
                    finish(sub, CloseReason::MaxDelivered);
                    return;
                }
                if drained {
                    finish(sub, CloseReason::Drained);
                    return;
                }
            }
            Some((SubItem::TimedOut, _)) => handler(None),
            None => {
                let drained = {
                    let st = sub.state.lock().unwrap();
                    st.draining && st.closed.is_none()
                };
                if drained {
                    finish(sub, CloseReason::Drained);
                    return;
                }
                if sub.unschedule_if_empty() {
                    return;
                }
            }
        }
    }
}

/// Spawns the dedicated dispatcher task for an owned-mode subscription.
pub(crate) fn spawn_owned_dispatcher(runtime: &Handle, sub: Arc<SubInner>) {
    runtime.spawn(async move {
        let Some(handler) = sub.handler.clone() else {
            return;
        };
        loop {
            let notified = sub.notify.notified();
            match sub.pop_for_delivery() {
                Some((SubItem::Msg(msg), exhausted)) => {
                    handler(Some(msg));
                    let drained = sub.after_delivery();
                    if exhausted {
                        finish(&sub, CloseReason::MaxDelivered);
                        return;
                    }
                    if drained {
                        finish(&sub, CloseReason::Drained);
                        return;
                    }
                }
                Some((SubItem::TimedOut, _)) => handler(None),
                None => {
                    {
                        let st = sub.state.lock().unwrap();
                        if st.closed.is_some() {
                            return;
                        }
                        if st.draining {
                            drop(st);
                            finish(&sub, CloseReason::Drained);
                            return;
                        }
                    }
                    notified.await;
                }
            }
        }
    });
}

/// Spawns the idle timer for a subscription created with a timeout: when the
/// queue stays empty for `timeout` after the last delivery, a marker is
/// queued so the handler sees a `None` message, once per idle window.
pub(crate) fn spawn_timeout_timer(runtime: &Handle, sub: Arc<SubInner>, timeout: Duration) {
    let handle = runtime.clone();
    runtime.spawn(async move {
        loop {
            let sleep_for = {
                let st = sub.state.lock().unwrap();
                if st.closed.is_some() {
                    return;
                }
                match st.idle_since {
                    Some(idle) if !st.timeout_fired => {
                        timeout.checked_sub(idle.elapsed()).unwrap_or(Duration::ZERO)
                    }
                    // Not idle (or already fired): poll again in a while.
                    _ => timeout,
                }
            };
            if sleep_for > Duration::ZERO {
                tokio::time::sleep(sleep_for).await;
                continue;
            }
            if sub.enqueue_timeout_marker() {
                schedule(&handle, sub.clone());
            }
            tokio::time::sleep(timeout).await;
        }
    });
}

/// Pool-mode drains have no waiting dispatcher; this nudges the worker so it
/// observes the draining flag.
pub(crate) fn signal_drain(runtime: &Handle, sub: &Arc<SubInner>) {
    let schedule_needed = {
        let mut st = sub.state.lock().unwrap();
        if st.scheduled {
            false
        } else {
            st.scheduled = true;
            true
        }
    };
    if schedule_needed {
        schedule(runtime, sub.clone());
    }
}

fn finish(sub: &Arc<SubInner>, reason: CloseReason) {
    Subscription { inner: sub.clone() }.finish(reason);
}
