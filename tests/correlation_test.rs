//! Integration tests for message event correlation.

use std::future::Future;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use flowcoord::Error;
use flowcoord::correlation::{
    CorrelationEngines, CorrelationKey, MessageCorrelationEngine, PayloadId, ThrowOutcome,
};
use flowcoord::model::TenantId;

fn full_key(message: &str, process: &str, node: &str) -> CorrelationKey {
    CorrelationKey::new()
        .with("messageName", message)
        .with("processName", process)
        .with("flowNodeName", node)
}

fn partial_key(message: &str, process: &str) -> CorrelationKey {
    CorrelationKey::new()
        .with("messageName", message)
        .with("processName", process)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Poll `fut` once so it registers its waiter, and report whether it is
/// still pending.
async fn poll_once<F: Future + Unpin>(fut: &mut F) -> bool {
    std::future::poll_fn(|cx| Poll::Ready(std::pin::Pin::new(&mut *fut).poll(cx).is_pending()))
        .await
}

// ---------------------------------------------------------------------------
// Throw first
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_throw_matches_waiter_immediately() {
    let engine = MessageCorrelationEngine::new();
    let outcome = engine.register_throw(full_key("M", "P", "F"), PayloadId(1));
    assert_eq!(outcome, ThrowOutcome::Stored);
    assert_eq!(engine.pending_throws(), 1);

    let matched = engine
        .await_match(partial_key("M", "P"), Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(matched, PayloadId(1));
    assert_eq!(engine.pending_throws(), 0);
}

#[tokio::test]
async fn oldest_matching_throw_is_taken_first() {
    let engine = MessageCorrelationEngine::new();
    engine.register_throw(full_key("M", "P", "A"), PayloadId(1));
    engine.register_throw(full_key("M", "P", "B"), PayloadId(2));

    assert_eq!(engine.try_match(&partial_key("M", "P")), Some(PayloadId(1)));
    assert_eq!(engine.try_match(&partial_key("M", "P")), Some(PayloadId(2)));
    assert_eq!(engine.try_match(&partial_key("M", "P")), None);
}

#[tokio::test]
async fn consumed_throw_is_never_matched_again() {
    let engine = MessageCorrelationEngine::new();
    engine.register_throw(full_key("M", "P", "F"), PayloadId(7));

    assert_eq!(engine.try_match(&partial_key("M", "P")), Some(PayloadId(7)));
    let err = engine
        .await_match(partial_key("M", "P"), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CorrelationTimeout { .. }));
}

#[tokio::test]
async fn partial_key_skips_throws_it_does_not_cover() {
    let engine = MessageCorrelationEngine::new();
    engine.register_throw(full_key("Other", "P", "F"), PayloadId(1));
    engine.register_throw(full_key("M", "P", "F"), PayloadId(2));

    let narrower = partial_key("M", "P").with("flowNodeName", "F");
    assert_eq!(engine.try_match(&narrower), Some(PayloadId(2)));
    assert_eq!(engine.pending_throws(), 1);
}

// ---------------------------------------------------------------------------
// Waiter first
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throw_is_handed_to_existing_waiter() {
    let engine = Arc::new(MessageCorrelationEngine::new());
    let waiter = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .await_match(partial_key("M", "P"), Duration::from_secs(5))
                .await
        })
    };
    settle().await;
    assert_eq!(engine.pending_waiters(), 1);

    let outcome = engine.register_throw(full_key("M", "P", "F"), PayloadId(3));
    assert_eq!(outcome, ThrowOutcome::HandedOff);
    assert_eq!(waiter.await.unwrap().unwrap(), PayloadId(3));
    assert_eq!(engine.pending_throws(), 0);
    assert_eq!(engine.pending_waiters(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiters_are_served_in_registration_order() {
    let engine = Arc::new(MessageCorrelationEngine::new());
    let spawn_waiter = |engine: &Arc<MessageCorrelationEngine>| {
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            engine
                .await_match(partial_key("M", "P"), Duration::from_secs(5))
                .await
        })
    };

    let first = spawn_waiter(&engine);
    settle().await;
    let second = spawn_waiter(&engine);
    settle().await;
    assert_eq!(engine.pending_waiters(), 2);

    engine.register_throw(full_key("M", "P", "F"), PayloadId(10));
    engine.register_throw(full_key("M", "P", "F"), PayloadId(11));

    assert_eq!(first.await.unwrap().unwrap(), PayloadId(10));
    assert_eq!(second.await.unwrap().unwrap(), PayloadId(11));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_matching_throw_stays_pending() {
    let engine = Arc::new(MessageCorrelationEngine::new());
    let waiter = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .await_match(partial_key("M", "P"), Duration::from_millis(100))
                .await
        })
    };
    settle().await;

    let outcome = engine.register_throw(full_key("M", "Q", "F"), PayloadId(4));
    assert_eq!(outcome, ThrowOutcome::Stored);

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::CorrelationTimeout { .. }));
    assert_eq!(engine.pending_throws(), 1);
    assert_eq!(engine.pending_waiters(), 0);
}

// ---------------------------------------------------------------------------
// Timeouts and cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timed_out_waiter_is_removed() {
    let engine = MessageCorrelationEngine::new();
    let err = engine
        .await_match(partial_key("M", "P"), Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.is_recoverable());
    assert_eq!(engine.pending_waiters(), 0);

    // A later throw is kept rather than sent to the departed waiter.
    let outcome = engine.register_throw(full_key("M", "P", "F"), PayloadId(5));
    assert_eq!(outcome, ThrowOutcome::Stored);
    assert_eq!(engine.pending_throws(), 1);
}

#[tokio::test]
async fn dropped_wait_withdraws_the_waiter() {
    let engine = MessageCorrelationEngine::new();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        engine.await_match(partial_key("M", "P"), Duration::from_secs(10)),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(engine.pending_waiters(), 0);

    assert_eq!(
        engine.register_throw(full_key("M", "P", "F"), PayloadId(6)),
        ThrowOutcome::Stored
    );
}

#[tokio::test(start_paused = true)]
async fn throw_handed_off_at_the_deadline_is_returned() {
    let engine = MessageCorrelationEngine::new();
    let mut wait = Box::pin(engine.await_match(partial_key("M", "P"), Duration::from_millis(10)));
    assert!(poll_once(&mut wait).await);
    assert_eq!(engine.pending_waiters(), 1);

    // The deadline passes before the waiter is polled again, and the throw
    // reaches it in between.
    tokio::time::advance(Duration::from_millis(10)).await;
    assert_eq!(
        engine.register_throw(full_key("M", "P", "F"), PayloadId(8)),
        ThrowOutcome::HandedOff
    );

    assert_eq!(wait.await.unwrap(), PayloadId(8));
    assert_eq!(engine.pending_throws(), 0);
    assert_eq!(engine.pending_waiters(), 0);
}

#[tokio::test]
async fn throw_reaching_a_dropped_wait_is_offered_again() {
    let engine = MessageCorrelationEngine::new();
    let mut wait = Box::pin(engine.await_match(partial_key("M", "P"), Duration::from_secs(10)));
    assert!(poll_once(&mut wait).await);

    assert_eq!(
        engine.register_throw(full_key("M", "P", "F"), PayloadId(9)),
        ThrowOutcome::HandedOff
    );
    drop(wait);

    assert_eq!(engine.pending_waiters(), 0);
    assert_eq!(engine.try_match(&partial_key("M", "P")), Some(PayloadId(9)));
}

#[tokio::test]
async fn aborted_waiter_task_gives_its_throw_to_the_next_waiter() {
    let engine = Arc::new(MessageCorrelationEngine::new());
    let spawn_waiter = |engine: &Arc<MessageCorrelationEngine>| {
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            engine
                .await_match(partial_key("M", "P"), Duration::from_secs(10))
                .await
        })
    };

    let first = spawn_waiter(&engine);
    while engine.pending_waiters() < 1 {
        tokio::task::yield_now().await;
    }
    let second = spawn_waiter(&engine);
    while engine.pending_waiters() < 2 {
        tokio::task::yield_now().await;
    }

    // Single-threaded runtime: the first waiter is woken by the hand-off but
    // does not run before it is aborted.
    assert_eq!(
        engine.register_throw(full_key("M", "P", "F"), PayloadId(12)),
        ThrowOutcome::HandedOff
    );
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    assert_eq!(second.await.unwrap().unwrap(), PayloadId(12));
    assert_eq!(engine.pending_throws(), 0);
    assert_eq!(engine.pending_waiters(), 0);
}

// ---------------------------------------------------------------------------
// Tenancy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tenants_have_separate_engines() {
    let engines = CorrelationEngines::new();
    let a = engines.for_tenant(TenantId(1));
    let b = engines.for_tenant(TenantId(2));

    a.register_throw(full_key("M", "P", "F"), PayloadId(1));
    assert_eq!(b.try_match(&partial_key("M", "P")), None);
    assert!(Arc::ptr_eq(&a, &engines.for_tenant(TenantId(1))));
    assert_eq!(
        engines.for_tenant(TenantId(1)).try_match(&partial_key("M", "P")),
        Some(PayloadId(1))
    );
}
