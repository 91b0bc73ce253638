//! Dispatch Path Benchmarks
//!
//! These benchmarks track the cost of the pieces every operation goes
//! through:
//! - Transition function and dedup gate: pure, in-memory
//! - Dispatch of a deduplicated fetch: gate only, no pipeline
//! - Full fetch cycle of a plain value through the pipeline and store
//! - Notification fan-out to many subscribers
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fetchflow_core::{is_redundant, transition, Meta, Operation, Request, State};
use fetchflow_runtime::{handler_fn, Engine, Source, TracingExchange};
use serde_json::json;

fn value_engine() -> Engine {
    Engine::new(handler_fn(|request, _| {
        Ok(Source::value(json!({ "id": request.id().as_str() })))
    }))
}

/// Benchmark the state machine in isolation
fn benchmark_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition");
    group.throughput(Throughput::Elements(1));

    let request = Request::from_id("bench");
    let fetch = Operation::fetch(&request);
    let lazy_put = Operation::put(&request, json!(1), Some(Meta::lazy()));

    group.bench_function("fetch_from_none", |b| {
        b.iter(|| transition(black_box(None), black_box(&fetch)));
    });

    group.bench_function("lazy_put_while_buffering", |b| {
        b.iter(|| transition(black_box(Some(State::Buffering)), black_box(&lazy_put)));
    });

    group.bench_function("gate_on_pending_fetch", |b| {
        b.iter(|| is_redundant(black_box(Some(State::Pending)), black_box(&fetch)));
    });

    group.finish();
}

/// Benchmark the engine's dispatch path
fn benchmark_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let _guard = runtime.enter();

    group.bench_function("deduplicated_fetch", |b| {
        let (source, _resolver) = fetchflow_testing::deferred();
        let handler = fetchflow_testing::ScriptedHandler::new();
        handler.then(source);
        let engine = Engine::new(handler);
        let request = Request::from_id("pending");
        engine.dispatch(Operation::fetch(&request));

        b.iter(|| engine.dispatch(black_box(Operation::fetch(&request))));
    });

    group.bench_function("value_fetch_cycle", |b| {
        let engine = value_engine();
        let request = Request::from_id("value");

        // complete -> fetch re-enters pending, so every iteration runs the
        // handler and commits two operations.
        b.iter(|| engine.dispatch(black_box(Operation::fetch(&request))));
    });

    group.bench_function("value_fetch_cycle_traced", |b| {
        let engine = Engine::builder(handler_fn(|_, _| Ok(Source::value(json!(null)))))
            .exchange(TracingExchange)
            .build();
        let request = Request::from_id("traced");

        b.iter(|| engine.dispatch(black_box(Operation::fetch(&request))));
    });

    group.finish();
}

/// Benchmark delivery to many subscribers of one request
fn benchmark_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let _guard = runtime.enter();

    for subscribers in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &subscribers| {
                let engine = value_engine();
                let request = Request::from_id("shared");
                let _handles: Vec<_> = (0..subscribers)
                    .map(|_| {
                        engine.subscribe(&request, |state, data, _| {
                            black_box((state, data));
                        })
                    })
                    .collect();

                b.iter(|| engine.dispatch(black_box(Operation::fetch(&request))));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_transition, benchmark_dispatch, benchmark_fan_out);
criterion_main!(benches);
