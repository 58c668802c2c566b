//! Benchmarks for priority dispatch and bus publication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use modulith_core::events::{DomainEvent, EventDispatcher, ModuleEventBus};
use serde_json::json;

fn dispatcher_with(listeners: usize, counter: &Arc<AtomicU64>) -> EventDispatcher {
    let dispatcher = EventDispatcher::new();
    for i in 0..listeners {
        let counter = Arc::clone(counter);
        dispatcher.on("order.placed", format!("listener-{i}"), (i % 7) as i32, move |_: &DomainEvent| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }
    dispatcher
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let event = DomainEvent::from_value("order.placed", json!({"order_id": "o-1", "total": 42})).unwrap();

    for listeners in [1, 10, 100] {
        let counter = Arc::new(AtomicU64::new(0));
        let dispatcher = dispatcher_with(listeners, &counter);
        group.throughput(Throughput::Elements(listeners as u64));
        group.bench_with_input(BenchmarkId::from_parameter(listeners), &listeners, |b, _| {
            b.iter(|| black_box(dispatcher.dispatch(black_box(&event))));
        });
    }
    group.finish();
}

fn bench_registration(c: &mut Criterion) {
    let mut group = c.benchmark_group("listener_registration");
    for listeners in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(listeners), &listeners, |b, &n| {
            b.iter(|| {
                let counter = Arc::new(AtomicU64::new(0));
                black_box(dispatcher_with(n, &counter))
            });
        });
    }
    group.finish();
}

fn bench_bus_publish(c: &mut Criterion) {
    let counter = Arc::new(AtomicU64::new(0));
    let bus = ModuleEventBus::new(Arc::new(dispatcher_with(10, &counter)));
    let event = DomainEvent::from_value("order.placed", json!({"order_id": "o-1"})).unwrap();

    c.bench_function("bus_publish_10_listeners", |b| {
        b.iter(|| black_box(bus.publish("orders", black_box(&event)).unwrap()));
    });
}

criterion_group!(benches, bench_dispatch, bench_registration, bench_bus_publish);
criterion_main!(benches);
