//! Integration tests for the engine's public surface
//!
//! Tests validate deduplication, re-fetching, the fetch-more gate,
//! prefetching and the operation broadcast.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use fetchflow_core::{FetchError, Operation, OperationKind, Request, State};
use fetchflow_runtime::{exchange_fn, handler_fn, Engine, EngineError, Source};
use fetchflow_testing::assertions::{assert_kinds, assert_states};
use fetchflow_testing::helpers::{drain, init_tracing};
use fetchflow_testing::{deferred, OperationLog, ScriptedHandler, SnapshotLog};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn user() -> Request {
    Request::new("user-1", json!({ "url": "/users/1" }))
}

#[tokio::test]
async fn test_repeated_fetch_while_pending_invokes_handler_once() {
    init_tracing();
    let (source, resolver) = deferred();
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::new(handler.clone());
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&user(), log.subscriber());
    for _ in 0..10 {
        let _ = engine.fetch(&user());
    }

    assert_eq!(handler.invocations(), 1);
    assert_eq!(engine.state(user().id()), Some(State::Pending));

    resolver.resolve(json!({ "id": 1, "name": "Dan" }));
    let done = log.wait_for_state(State::Completed).await;

    assert_eq!(done.data, Some(json!({ "id": 1, "name": "Dan" })));
    assert_states(&log.states(), &[State::Pending, State::Completed]);
    assert_eq!(handler.invocations(), 1);
}

#[tokio::test]
async fn test_fetch_after_complete_invokes_handler_again() {
    let handler = ScriptedHandler::new();
    handler.then_value(json!(1)).then_value(json!(2));
    let engine = Engine::new(handler.clone());
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&user(), log.subscriber());
    log.wait_for(2).await;
    let _ = engine.fetch(&user());
    log.wait_for(4).await;

    assert_eq!(handler.invocations(), 2);
    assert_states(
        &log.states(),
        &[State::Pending, State::Completed, State::Pending, State::Completed],
    );
    assert_eq!(engine.data(user().id()), Some(json!(2)));
}

#[tokio::test]
async fn test_fetch_after_cancel_invokes_handler_again() {
    let (first, _resolver) = deferred();
    let handler = ScriptedHandler::new();
    handler.then(first).then_value(json!("again"));
    let engine = Engine::new(handler.clone());
    let log = SnapshotLog::new();

    let handle = engine.subscribe(&user(), log.subscriber());
    handle.cancel();
    assert_eq!(handle.state(), Some(State::Cancelled));

    let _ = engine.fetch(&user());
    log.wait_for_state(State::Completed).await;

    assert_eq!(handler.invocations(), 2);
    assert_states(
        &log.states(),
        &[State::Pending, State::Cancelled, State::Pending, State::Completed],
    );
}

#[tokio::test]
async fn test_failed_request_exposes_error_and_last_data() {
    let handler = ScriptedHandler::new();
    handler.then(Source::stream(async_stream::stream! {
        yield Ok(json!("chunk"));
        yield Err(FetchError::msg("x"));
    }));
    let engine = Engine::new(handler);
    let log = SnapshotLog::new();

    let handle = engine.subscribe(&user(), log.subscriber());
    log.wait_for_state(State::Ready).await;
    handle.fetch_more().unwrap();
    let failed = log.wait_for_state(State::Failed).await;

    assert_eq!(failed.error, Some(FetchError::msg("x")));
    assert_eq!(failed.data, Some(json!("chunk")));
    assert!(log.deliveries().iter().filter(|d| d.state != State::Failed).all(|d| d.error.is_none()));
}

#[tokio::test]
async fn test_handler_error_becomes_reject() {
    let handler = ScriptedHandler::new();
    handler.then_fail(FetchError::msg("no route"));
    let engine = Engine::new(handler);
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&user(), log.subscriber());

    // Synchronous failure settles within the subscribe call.
    assert_states(&log.states(), &[State::Pending, State::Failed]);
    assert_eq!(log.last().unwrap().error, Some(FetchError::msg("no route")));
}

#[tokio::test]
async fn test_has_more_gates_fetch_more() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::iter([Ok(json!([1, 2])), Ok(json!([3]))]))
    }));
    let log = SnapshotLog::new();

    let handle = engine.subscribe(&user(), log.subscriber());
    assert!(!handle.has_more());
    assert_eq!(
        handle.fetch_more(),
        Err(EngineError::NothingMoreToFetch {
            request: user().id().clone(),
            state: Some(State::Pending),
        })
    );

    log.wait_for_state(State::Ready).await;
    assert!(handle.has_more());
    handle.fetch_more().unwrap();

    // Buffering until the next chunk lands.
    assert!(!handle.has_more());
    assert!(handle.fetch_more().is_err());
    log.wait_for(4).await;

    assert_states(
        &log.states(),
        &[State::Pending, State::Ready, State::Buffering, State::Ready],
    );
    assert_eq!(handle.data(), Some(json!([3])));
}

#[tokio::test]
async fn test_fetch_more_from_subscriber_is_queued() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::iter([Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]))
    }));
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();
    let sink = engine.sink();
    let request = user();
    let readies = Arc::new(AtomicUsize::new(0));

    let record = log.subscriber();
    let _handle = engine.subscribe(&request, {
        let request = request.clone();
        let readies = Arc::clone(&readies);
        move |state, data, error| {
            record(state, data, error);
            // Three chunks, then one more pull to exhaust the stream.
            if state == State::Ready && readies.fetch_add(1, Ordering::SeqCst) < 3 {
                sink.dispatch(Operation::fetch(&request));
            }
        }
    });

    log.wait_for(8).await;
    assert_states(
        &log.states(),
        &[
            State::Pending,
            State::Ready,
            State::Buffering,
            State::Ready,
            State::Buffering,
            State::Ready,
            State::Buffering,
            State::Ready,
        ],
    );

    let ops = drain(&mut rx);
    assert_eq!(ops.last().map(Operation::kind), Some(OperationKind::Complete));
    let chunks: Vec<_> = ops
        .iter()
        .filter(|op| op.kind() == OperationKind::Put)
        .filter_map(|op| op.data().cloned())
        .collect();
    assert_eq!(chunks, [json!(1), json!(2), json!(3)]);

    // An exhausted stream keeps its last chunk.
    assert_eq!(engine.data(request.id()), Some(json!(3)));
}

#[tokio::test]
async fn test_prefetch_delivers_without_second_fetch() {
    let handler = ScriptedHandler::new();
    handler.then_value(json!({ "id": 1 }));
    let engine = Engine::new(handler.clone());

    engine.prefetch(&user());
    engine.prefetch(&user());
    assert_eq!(engine.state(user().id()), Some(State::Completed));
    assert!(engine.is_disposal_scheduled(user().id()));

    let log = SnapshotLog::new();
    let handle = engine.subscribe(&user(), log.subscriber());

    assert_eq!(handler.invocations(), 1);
    assert_eq!(log.deliveries().len(), 1);
    assert_eq!(log.last().unwrap().data, Some(json!({ "id": 1 })));
    assert!(handle.is_subscribed());
    assert!(!engine.is_disposal_scheduled(user().id()));
}

#[tokio::test]
async fn test_prefetched_snapshot_is_delivered_in_queue_order() {
    let (source, _resolver) = deferred();
    let handler = ScriptedHandler::new();
    handler.then(source).then_value(json!("other"));
    let engine = Engine::new(handler);
    let report = Request::from_id("report");
    engine.prefetch(&report);
    assert_eq!(engine.state(report.id()), Some(State::Pending));

    // Subscribing from inside a delivery: the newer `complete` is already
    // queued when the snapshot is requested.
    let log = SnapshotLog::new();
    let _other = engine.subscribe(&Request::from_id("other"), {
        let engine = engine.clone();
        let sink = engine.sink();
        let log = log.clone();
        let report = report.clone();
        move |state, _, _| {
            if state == State::Completed {
                sink.emit(Operation::complete(&report, Some(json!("fresh"))));
                let _ = engine.subscribe(&report, log.subscriber());
            }
        }
    });

    let delivered = log.deliveries();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].state, State::Completed);
    assert_eq!(delivered[0].data, Some(json!("fresh")));
}

#[tokio::test]
async fn test_dispatch_runs_through_gate() {
    let operations = OperationLog::new();
    let engine = Engine::builder(handler_fn(|_, _| Ok(Source::value(json!(1)))))
        .exchange(operations.clone())
        .build();

    // No record: a put changes nothing and never reaches an exchange.
    engine.dispatch(Operation::put(&user(), json!(0), None));
    assert!(operations.operations().is_empty());
    assert_eq!(engine.state(user().id()), None);

    engine.dispatch(Operation::fetch(&user()));
    engine.dispatch(Operation::dispose(&user()));

    assert_kinds(
        &operations.operations(),
        &[OperationKind::Fetch, OperationKind::Dispose],
    );
    assert_eq!(engine.state(user().id()), None);
}

#[tokio::test]
async fn test_dispose_reaches_subscribers() {
    let engine = Engine::new(handler_fn(|_, _| Ok(Source::value(json!(1)))));
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&user(), log.subscriber());
    engine.dispatch(Operation::dispose(&user()));

    let disposed = log.last().unwrap();
    assert_eq!(disposed.state, State::Disposed);
    assert_eq!(disposed.data, None);
    assert!(engine.record(user().id()).is_none());
}

#[tokio::test]
async fn test_operation_broadcast_reports_commits_in_order() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::future(async { Ok(json!({ "id": 1, "name": "Dan" })) }))
    }));
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&user(), log.subscriber());
    log.wait_for_state(State::Completed).await;

    let ops = drain(&mut rx);
    assert_kinds(&ops, &[OperationKind::Fetch, OperationKind::Complete]);
    assert_eq!(ops[1].data(), Some(&json!({ "id": 1, "name": "Dan" })));
}

#[tokio::test]
async fn test_exchanges_run_in_order_before_fetch() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let order = Arc::clone(&order);
        exchange_fn("first", move |op, _cx, next| {
            order.lock().unwrap().push("first");
            next.run(op);
        })
    };
    let second = {
        let order = Arc::clone(&order);
        exchange_fn("second", move |op, _cx, next| {
            order.lock().unwrap().push("second");
            next.run(op);
        })
    };

    let handler = ScriptedHandler::new();
    handler.then_value(json!(1));
    let engine = Engine::builder(handler.clone())
        .exchange(first)
        .exchange(second)
        .build();

    let _ = engine.fetch(&user());

    assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    assert_eq!(handler.invocations(), 1);
}

#[tokio::test]
async fn test_exchange_can_answer_without_handler() {
    let fixtures = exchange_fn("fixtures", |op, cx, next| {
        if op.kind() == OperationKind::Fetch && op.id().as_str() == "fixture" {
            let request = op.request().clone();
            cx.emit(op);
            cx.emit(Operation::complete(&request, Some(json!("from fixture"))));
        } else {
            next.run(op);
        }
    });

    let handler = ScriptedHandler::new();
    let engine = Engine::builder(handler.clone()).exchange(fixtures).build();
    let _ = engine.fetch(&Request::from_id("fixture"));

    assert_eq!(engine.state(&"fixture".into()), Some(State::Completed));
    assert_eq!(engine.data(&"fixture".into()), Some(json!("from fixture")));
    assert_eq!(handler.invocations(), 0);
}

#[tokio::test]
async fn test_swallowed_cancel_leaves_request_running() {
    let ignore_cancel = exchange_fn("ignore-cancel", |op, _cx, next| {
        if op.kind() != OperationKind::Cancel {
            next.run(op);
        }
    });
    let (source, resolver) = deferred();
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::builder(handler).exchange(ignore_cancel).build();
    let log = SnapshotLog::new();

    let handle = engine.subscribe(&user(), log.subscriber());
    handle.cancel();
    assert_eq!(handle.state(), Some(State::Pending));

    resolver.resolve(json!("done"));
    log.wait_for_state(State::Completed).await;
}

#[tokio::test]
async fn test_cache_is_visible_to_handlers() {
    let engine = Engine::new(handler_fn(|request, cx| {
        let seen = cx.cache().keys().len();
        Ok(Source::value(json!({ "id": request.id().as_str(), "seen": seen })))
    }));

    let _ = engine.fetch(&Request::from_id("a"));
    let _ = engine.fetch(&Request::from_id("b"));

    let cache = engine.cache();
    assert!(cache.has(&"a".into()));
    assert_eq!(cache.get(&"b".into()), Some(json!({ "id": "b", "seen": 1 })));
    assert_eq!(cache.entries().len(), 2);
}
