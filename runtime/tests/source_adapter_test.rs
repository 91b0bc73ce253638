//! Integration tests for source adaptation through the fetch exchange
//!
//! Each source kind is driven through a real engine and checked against the
//! operations committed to the store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use fetchflow_core::{FetchError, Operation, OperationKind, Request, State};
use fetchflow_runtime::{handler_fn, Engine, Source};
use fetchflow_testing::assertions::{assert_kinds, assert_none_after, kinds};
use fetchflow_testing::helpers::drain;
use fetchflow_testing::{deferred, manual_observable, ScriptedHandler, SnapshotLog};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use OperationKind::{Cancel, Complete, Fetch, Put, Reject};

fn request() -> Request {
    Request::new("stream", json!({ "url": "/items" }))
}

fn puts(ops: &[Operation]) -> Vec<(Value, bool)> {
    ops.iter()
        .filter(|op| op.kind() == Put)
        .map(|op| (op.data().cloned().unwrap(), op.is_lazy()))
        .collect()
}

#[tokio::test]
async fn test_promise_resolves_to_single_complete() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::future(async { Ok(json!({ "id": 1, "name": "Dan" })) }))
    }));
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    log.wait_for_state(State::Completed).await;

    let ops = drain(&mut rx);
    assert_kinds(&ops, &[Fetch, Complete]);
    assert_eq!(ops[1].data(), Some(&json!({ "id": 1, "name": "Dan" })));
}

#[tokio::test]
async fn test_promise_rejection_becomes_reject() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::future(async { Err(FetchError::msg("x")) }))
    }));
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    let failed = log.wait_for_state(State::Failed).await;

    assert_kinds(&drain(&mut rx), &[Fetch, Reject]);
    assert_eq!(failed.error, Some(FetchError::msg("x")));
}

#[tokio::test]
async fn test_anyhow_future_error_is_flattened() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::try_future(async {
            let parsed: Value = serde_json::from_str("{ not json")?;
            Ok(parsed)
        }))
    }));
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    let failed = log.wait_for_state(State::Failed).await;

    assert!(matches!(failed.error, Some(FetchError::Message(_))));
}

#[tokio::test]
async fn test_plain_value_completes_immediately() {
    let engine = Engine::new(handler_fn(|_, _| Ok(Source::value(json!([1, 2, 3])))));
    let mut rx = engine.subscribe_operations();

    let handle = engine.fetch(&request());

    assert_eq!(handle.state(), Some(State::Completed));
    assert_eq!(handle.data(), Some(json!([1, 2, 3])));
    assert_kinds(&drain(&mut rx), &[Fetch, Complete]);
}

#[tokio::test]
async fn test_observable_pushes_eager_puts_then_completes() {
    let (source, controller) = manual_observable();
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::new(handler);
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    assert!(controller.is_subscribed());

    controller.next(json!("chunk-1"));
    controller.next(json!("chunk-2"));
    controller.complete();

    let ops = drain(&mut rx);
    assert_kinds(&ops, &[Fetch, Put, Put, Complete]);
    assert_eq!(
        puts(&ops),
        [(json!("chunk-1"), false), (json!("chunk-2"), false)]
    );
    assert_eq!(
        log.states(),
        [State::Pending, State::Buffering, State::Buffering, State::Ready]
    );
    assert_eq!(log.last().unwrap().data, Some(json!("chunk-2")));

    // Completion releases the subscription.
    assert!(controller.is_unsubscribed());
}

#[tokio::test]
async fn test_observable_error_becomes_reject() {
    let (source, controller) = manual_observable();
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::new(handler);
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    controller.next(json!(1));
    controller.error(FetchError::msg("socket closed"));
    controller.next(json!(2));

    assert_eq!(
        log.states(),
        [State::Pending, State::Buffering, State::Failed]
    );
    assert_eq!(log.last().unwrap().data, Some(json!(1)));
}

#[tokio::test]
async fn test_observable_emitting_from_a_task() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::observable(|observer| {
            let task = tokio::spawn(async move {
                for i in 0..3 {
                    tokio::task::yield_now().await;
                    observer.next(json!(i));
                }
                observer.complete();
            });
            fetchflow_runtime::Subscription::new(move || task.abort())
        }))
    }));
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    log.wait_for_state(State::Ready).await;

    let ops = drain(&mut rx);
    assert_kinds(&ops, &[Fetch, Put, Put, Put, Complete]);
}

#[tokio::test]
async fn test_generator_pulls_one_value_per_fetch() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::stream(async_stream::stream! {
            yield Ok(json!("chunk-1"));
            yield Ok(json!("chunk-2"));
        }))
    }));
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();

    let handle = engine.subscribe(&request(), log.subscriber());
    log.wait_for(2).await;
    assert_eq!(puts(&drain(&mut rx)), [(json!("chunk-1"), true)]);

    handle.fetch_more().unwrap();
    log.wait_for(4).await;
    assert_eq!(puts(&drain(&mut rx)), [(json!("chunk-2"), true)]);

    handle.fetch_more().unwrap();
    log.wait_for(6).await;
    let last = drain(&mut rx);
    assert_kinds(&last, &[Fetch, Complete]);
    assert_eq!(last[1].data(), None);

    assert_eq!(
        log.states(),
        [
            State::Pending,
            State::Ready,
            State::Buffering,
            State::Ready,
            State::Buffering,
            State::Ready,
        ]
    );
    assert_eq!(handle.data(), Some(json!("chunk-2")));
}

#[tokio::test]
async fn test_generator_error_becomes_reject() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::iter([Err(FetchError::msg("bad page"))]))
    }));
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    let failed = log.wait_for_state(State::Failed).await;

    assert_eq!(failed.error, Some(FetchError::msg("bad page")));
}

#[tokio::test]
async fn test_pull_callback_empty_pull_emits_nothing() {
    let (calls_tx, mut calls) = mpsc::unbounded_channel();
    let counter = Arc::new(AtomicUsize::new(0));
    let engine = Engine::new(handler_fn(move |_, _| {
        let counter = Arc::clone(&counter);
        let calls_tx = calls_tx.clone();
        Ok(Source::pull(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            let _ = calls_tx.send(call);
            async move {
                Ok(match call {
                    0 => Some(json!(1)),
                    1 => None,
                    _ => Some(json!(2)),
                })
            }
        }))
    }));
    let mut rx = engine.subscribe_operations();
    let req = request();

    let _handle = engine.fetch(&req);
    assert_eq!(calls.recv().await, Some(0));
    assert_kinds(&drain(&mut rx), &[Fetch, Put]);
    assert_eq!(engine.state(req.id()), Some(State::Buffering));

    engine.dispatch(Operation::fetch(&req));
    assert_eq!(calls.recv().await, Some(1));
    assert_kinds(&drain(&mut rx), &[Fetch]);

    engine.dispatch(Operation::fetch(&req));
    assert_eq!(calls.recv().await, Some(2));
    let last = drain(&mut rx);
    assert_kinds(&last, &[Fetch, Put]);
    assert_eq!(puts(&last), [(json!(2), false)]);
}

/// Pull callback answering `script[n]` on its n-th call, reporting each call.
fn scripted_pull(script: Vec<Option<Value>>) -> (Source, mpsc::UnboundedReceiver<usize>) {
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let counter = AtomicUsize::new(0);
    let source = Source::pull(move || {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        let _ = calls_tx.send(call);
        let answer = script.get(call).cloned().flatten();
        async move { Ok(answer) }
    });
    (source, calls)
}

#[tokio::test]
async fn test_pull_callback_empty_first_pull_resumes_on_next_fetch() {
    let (source, mut calls) = scripted_pull(vec![None, Some(json!(1)), Some(json!(2))]);
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::new(handler.clone());
    let mut rx = engine.subscribe_operations();
    let req = request();
    let log = SnapshotLog::new();

    let handle = engine.subscribe(&req, log.subscriber());
    assert_eq!(calls.recv().await, Some(0));
    assert_kinds(&drain(&mut rx), &[Fetch]);
    assert_eq!(engine.state(req.id()), Some(State::Pending));
    assert!(handle.has_more());

    // Still pending, yet the fetch reaches the parked callback.
    engine.dispatch(Operation::fetch(&req));
    assert_eq!(calls.recv().await, Some(1));
    let resumed = drain(&mut rx);
    assert_kinds(&resumed, &[Fetch, Put]);
    assert_eq!(puts(&resumed), [(json!(1), false)]);
    assert_eq!(engine.state(req.id()), Some(State::Buffering));

    handle.fetch_more().unwrap();
    assert_eq!(calls.recv().await, Some(2));
    assert_kinds(&drain(&mut rx), &[Fetch, Put]);

    assert_eq!(handler.invocations(), 1);
    assert_eq!(log.last().unwrap().data, Some(json!(2)));
}

#[tokio::test]
async fn test_pull_callback_empty_pulls_after_a_value_keep_it_parked() {
    let (source, mut calls) = scripted_pull(vec![Some(json!(1)), None, None, Some(json!(2))]);
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::new(handler.clone());
    let mut rx = engine.subscribe_operations();
    let req = request();

    let handle = engine.fetch(&req);
    assert_eq!(calls.recv().await, Some(0));
    assert_kinds(&drain(&mut rx), &[Fetch, Put]);

    for expected in [1, 2] {
        assert!(handle.has_more());
        handle.fetch_more().unwrap();
        assert_eq!(calls.recv().await, Some(expected));
        assert_kinds(&drain(&mut rx), &[Fetch]);
        assert_eq!(engine.state(req.id()), Some(State::Buffering));
        assert_eq!(engine.data(req.id()), Some(json!(1)));
    }

    handle.fetch_more().unwrap();
    assert_eq!(calls.recv().await, Some(3));
    let last = drain(&mut rx);
    assert_kinds(&last, &[Fetch, Put]);
    assert_eq!(puts(&last), [(json!(2), false)]);
    assert_eq!(handler.invocations(), 1);
}

#[tokio::test]
async fn test_panicking_source_is_rejected() {
    let engine = Engine::new(handler_fn(|_, _| {
        Ok(Source::future(async {
            let missing: Option<Value> = None;
            Ok(missing.expect("boom"))
        }))
    }));
    let log = SnapshotLog::new();

    let _handle = engine.subscribe(&request(), log.subscriber());
    let failed = log.wait_for_state(State::Failed).await;

    let error = failed.error.unwrap();
    assert!(error.is_panic());
    assert_eq!(error, FetchError::Panicked("boom".into()));
}

#[tokio::test]
async fn test_cancel_suppresses_value_queued_before_it() {
    let (source, controller) = manual_observable();
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::new(handler);
    let mut rx = engine.subscribe_operations();
    let req = request();

    let sink = engine.sink();
    let fired = AtomicBool::new(false);
    let racing = controller.clone();
    let log = SnapshotLog::new();
    let record = log.subscriber();
    let _handle = engine.subscribe(&req, {
        let req = req.clone();
        move |state, data, error| {
            record(state, data, error);
            if state == State::Buffering && !fired.swap(true, Ordering::SeqCst) {
                // Both land on the queue behind this delivery: the cancel
                // first, then the value the producer had already in flight.
                sink.dispatch(Operation::cancel(&req));
                racing.next(json!("late"));
            }
        }
    });

    controller.next(json!("first"));
    controller.complete();

    let ops = drain(&mut rx);
    assert_kinds(&ops, &[Fetch, Put, Cancel]);
    assert_none_after(&ops, Cancel, &[Put, Complete, Reject]);
    assert_eq!(engine.data(req.id()), Some(json!("first")));
    assert_eq!(engine.state(req.id()), Some(State::Cancelled));
    assert!(controller.is_unsubscribed());
}

#[tokio::test]
async fn test_cancel_before_resolution_drops_result() {
    let (source, resolver) = deferred();
    let handler = ScriptedHandler::new();
    handler.then(source);
    let engine = Engine::new(handler);
    let mut rx = engine.subscribe_operations();
    let log = SnapshotLog::new();

    let handle = engine.subscribe(&request(), log.subscriber());
    let _ = resolver.resolve(json!("too late"));
    handle.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_kinds(&drain(&mut rx), &[Fetch, Cancel]);
    assert_eq!(log.states(), [State::Pending, State::Cancelled]);
    assert_eq!(handle.data(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_completion_never_loses() {
    let engine = Engine::new(handler_fn(|request, _| {
        let delay = request.descriptor()["delay_us"].as_u64().unwrap_or(0);
        Ok(Source::future(async move {
            tokio::time::sleep(Duration::from_micros(delay)).await;
            Ok(json!("done"))
        }))
    }));
    let mut rx = engine.subscribe_operations();

    let mut handles = Vec::new();
    for i in 0..50u64 {
        let request = Request::new(format!("race-{i}"), json!({ "delay_us": i * 20 }));
        handles.push(engine.fetch(&request));
    }
    tokio::time::sleep(Duration::from_micros(500)).await;
    for handle in &handles {
        handle.cancel();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ops = drain(&mut rx);
    for handle in &handles {
        let id = handle.request().id();
        let mine: Vec<_> = ops.iter().filter(|op| op.id() == id).cloned().collect();
        match handle.state() {
            Some(State::Cancelled) => assert_none_after(&mine, Cancel, &[Put, Complete]),
            Some(State::Completed) => assert_eq!(kinds(&mine), [Fetch, Complete]),
            other => panic!("{id} ended in {other:?}"),
        }
    }
}
