//! Integration tests for subscription delivery: async handlers, ordering,
//! auto-unsubscribe, slow consumers, queue groups and drain.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_until, MockServer};
use natslink::{Connection, Error, Options};

fn opts_for(server: &MockServer) -> Options {
    Options {
        urls: vec![server.url()],
        allow_reconnect: false,
        ..Options::default()
    }
}

#[tokio::test]
async fn async_handler_receives_in_publish_order() {
    let server = MockServer::start().await;
    let nc = Connection::connect(opts_for(&server)).await.expect("connect");

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let seen_cb = seen.clone();
    let _sub = nc
        .subscribe("ord", move |msg| {
            if let Some(msg) = msg {
                seen_cb.lock().unwrap().push(msg.payload);
            }
        })
        .expect("subscribe");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    for i in 0u32..50 {
        nc.publish("ord", &i.to_be_bytes()).await.expect("publish");
    }
    assert!(
        wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 50).await,
        "all 50 messages must be delivered"
    );
    let seen = seen.lock().unwrap();
    for (i, payload) in seen.iter().enumerate() {
        assert_eq!(payload, &(i as u32).to_be_bytes());
    }

    nc.close().await;
    server.stop().await;
}

#[tokio::test]
async fn auto_unsubscribe_caps_deliveries() {
    let server = MockServer::start().await;
    let nc = Connection::connect(opts_for(&server)).await.expect("connect");

    // Async subscription on a wildcard, capped at two deliveries, five
    // publishes on a matching subject.
    let calls = Arc::new(AtomicU64::new(0));
    let calls_cb = calls.clone();
    let sub = nc
        .subscribe("a.*", move |msg| {
            if msg.is_some() {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("subscribe");
    sub.auto_unsubscribe(2).expect("auto_unsubscribe");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    for _ in 0..5 {
        nc.publish("a.x", b"ping").await.expect("publish");
    }
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    assert!(
        wait_until(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 2).await,
        "handler must run exactly twice"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2, "no deliveries past the cap");
    assert!(!sub.is_valid(), "subscription must be invalid after the cap");

    nc.close().await;
    server.stop().await;
}

#[tokio::test]
async fn sync_auto_unsubscribe_reports_max_delivered() {
    let server = MockServer::start().await;
    let nc = Connection::connect(opts_for(&server)).await.expect("connect");

    let sub = nc.subscribe_sync("m").expect("subscribe");
    sub.auto_unsubscribe(1).expect("auto_unsubscribe");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    nc.publish("m", b"one").await.expect("publish");
    nc.publish("m", b"two").await.expect("publish");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    let msg = sub
        .next_msg(Some(Duration::from_secs(1)))
        .await
        .expect("first message");
    assert_eq!(msg.payload, b"one");
    let err = sub.next_msg(Some(Duration::from_secs(1))).await.unwrap_err();
    assert!(matches!(err, Error::MaxDelivered), "got {err:?}");

    nc.close().await;
    server.stop().await;
}

#[tokio::test]
async fn slow_consumer_drops_and_isolates() {
    let server = MockServer::start().await;
    let sc_errors = Arc::new(AtomicU64::new(0));
    let sc_errors_cb = sc_errors.clone();
    let nc = Connection::connect(Options {
        error_callback: Some(Arc::new(move |subject, error| {
            if matches!(error, Error::SlowConsumer) && subject.as_deref() == Some("flood") {
                sc_errors_cb.fetch_add(1, Ordering::SeqCst);
            }
        })),
        ..opts_for(&server)
    })
    .await
    .expect("connect");

    // A sync subscription nobody reads, capped at 64 KiB.
    let slow = nc.subscribe_sync("flood").expect("subscribe slow");
    slow.set_pending_limits(1 << 20, 64 * 1024).expect("limits");
    // A healthy subscription on the same connection.
    let healthy = nc.subscribe_sync("steady").expect("subscribe healthy");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    // 1 MiB in 16 KiB chunks blows the 64 KiB cap.
    let chunk = vec![7u8; 16 * 1024];
    for _ in 0..64 {
        nc.publish("flood", &chunk).await.expect("publish flood");
    }
    nc.publish("steady", b"still here").await.expect("publish steady");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    assert!(
        wait_until(Duration::from_secs(2), || slow.dropped() > 0).await,
        "the flooded subscription must drop messages"
    );
    assert!(
        wait_until(Duration::from_secs(1), || {
            sc_errors.load(Ordering::SeqCst) >= 1
        })
        .await,
        "the slow-consumer error callback must fire"
    );

    // Other subscriptions keep flowing.
    let msg = healthy
        .next_msg(Some(Duration::from_secs(1)))
        .await
        .expect("healthy subscription still delivers");
    assert_eq!(msg.payload, b"still here");

    // Dropped + queued never exceeds what was sent.
    let (queued, queued_bytes) = slow.pending();
    assert!(queued_bytes <= 64 * 1024, "pending bytes stay under the cap");
    assert_eq!(queued as u64 + slow.dropped(), 64);

    nc.close().await;
    server.stop().await;
}

#[tokio::test]
async fn queue_group_delivers_to_one_member() {
    let server = MockServer::start().await;
    let nc = Connection::connect(opts_for(&server)).await.expect("connect");

    let a = Arc::new(AtomicU64::new(0));
    let b = Arc::new(AtomicU64::new(0));
    let a_cb = a.clone();
    let b_cb = b.clone();
    let _qa = nc
        .queue_subscribe("work", "workers", move |msg| {
            if msg.is_some() {
                a_cb.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("queue subscribe a");
    let _qb = nc
        .queue_subscribe("work", "workers", move |msg| {
            if msg.is_some() {
                b_cb.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("queue subscribe b");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    for _ in 0..20 {
        nc.publish("work", b"job").await.expect("publish");
    }
    assert!(
        wait_until(Duration::from_secs(2), || {
            a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst) == 20
        })
        .await,
        "each job must go to exactly one group member"
    );

    nc.close().await;
    server.stop().await;
}

#[tokio::test]
async fn subscription_timeout_signals_idle_handler() {
    let server = MockServer::start().await;
    let nc = Connection::connect(opts_for(&server)).await.expect("connect");

    let timeouts = Arc::new(AtomicU64::new(0));
    let messages = Arc::new(AtomicU64::new(0));
    let timeouts_cb = timeouts.clone();
    let messages_cb = messages.clone();
    let _sub = nc
        .subscribe_with_timeout("quiet", Duration::from_millis(50), move |msg| match msg {
            Some(_) => {
                messages_cb.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                timeouts_cb.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("subscribe with timeout");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    // Idle: the handler is told once.
    assert!(
        wait_until(Duration::from_secs(1), || timeouts.load(Ordering::SeqCst) == 1).await,
        "idle timeout must fire"
    );
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1, "and only once while idle");

    // A message re-arms the clock.
    nc.publish("quiet", b"wake").await.expect("publish");
    assert!(wait_until(Duration::from_secs(1), || messages.load(Ordering::SeqCst) == 1).await);
    assert!(
        wait_until(Duration::from_secs(1), || timeouts.load(Ordering::SeqCst) == 2).await,
        "timeout must fire again after the next idle window"
    );

    nc.close().await;
    server.stop().await;
}

#[tokio::test]
async fn drain_subscription_delivers_backlog_then_invalidates() {
    let server = MockServer::start().await;
    let nc = Connection::connect(opts_for(&server)).await.expect("connect");

    let sub = nc.subscribe_sync("d").expect("subscribe");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");
    for i in 0u32..3 {
        nc.publish("d", &i.to_be_bytes()).await.expect("publish");
    }
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");
    // Make sure the messages are queued client-side before draining.
    assert!(wait_until(Duration::from_secs(1), || sub.pending().0 == 3).await);

    sub.drain().expect("drain");
    for i in 0u32..3 {
        let msg = sub
            .next_msg(Some(Duration::from_secs(1)))
            .await
            .expect("backlog must survive drain");
        assert_eq!(msg.payload, i.to_be_bytes());
    }
    sub.wait_for_drain_completion(Some(Duration::from_secs(1)))
        .await
        .expect("drain completion");
    assert!(!sub.is_valid());

    nc.close().await;
    server.stop().await;
}

#[tokio::test]
async fn shared_pool_delivery_keeps_order() {
    let server = MockServer::start().await;
    let nc = Connection::connect(Options {
        use_shared_delivery_pool: true,
        ..opts_for(&server)
    })
    .await
    .expect("connect");

    let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
    let seen_cb = seen.clone();
    let _sub = nc
        .subscribe("pooled", move |msg| {
            if let Some(msg) = msg {
                let n = u32::from_be_bytes(msg.payload[..4].try_into().unwrap());
                seen_cb.lock().unwrap().push(n);
            }
        })
        .expect("subscribe");
    nc.flush(Some(Duration::from_secs(1))).await.expect("flush");

    for i in 0u32..40 {
        nc.publish("pooled", &i.to_be_bytes()).await.expect("publish");
    }
    assert!(
        wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 40).await,
        "pool must deliver everything"
    );
    assert_eq!(*seen.lock().unwrap(), (0u32..40).collect::<Vec<_>>());

    nc.close().await;
    server.stop().await;
}
