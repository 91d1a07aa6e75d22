//! Throughput benchmarks: one producer, one consumer, per wait strategy,
//! with a crossbeam channel baseline for comparison.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ringline::{
    BlockingWaitStrategy, BusySpinWaitStrategy, DefaultEventFactory, Engine, ProducerMode,
    SleepingWaitStrategy, WaitStrategy, YieldingWaitStrategy,
};

const CAPACITY: usize = 1024;
const EVENTS: i64 = 100_000;

#[derive(Debug, Default)]
struct BenchEvent {
    value: i64,
}

fn run_pipeline<W>(wait_strategy: W)
where
    W: WaitStrategy + 'static,
{
    let last = Arc::new(AtomicI64::new(-1));
    let sink = Arc::clone(&last);

    let mut engine = Engine::new(
        DefaultEventFactory::<BenchEvent>::new(),
        CAPACITY,
        ProducerMode::Single,
        wait_strategy,
    )
    .unwrap()
    .handle_events_with(move |event: &mut BenchEvent, _: i64, _: bool| {
        sink.store(event.value, Ordering::Release);
        Ok(())
    })
    .build();

    engine.start().unwrap();
    let mut producer = engine.producer().unwrap();
    for value in 0..EVENTS {
        producer.publish(|event| event.value = value);
    }
    engine.drain();
    engine.shutdown().unwrap();
    assert_eq!(last.load(Ordering::Acquire), EVENTS - 1);
}

fn bench_wait_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_throughput");
    group.throughput(Throughput::Elements(EVENTS as u64));
    group.sample_size(10);

    group.bench_function(BenchmarkId::new("ringline", "busy_spin"), |b| {
        b.iter(|| run_pipeline(BusySpinWaitStrategy::new()));
    });
    group.bench_function(BenchmarkId::new("ringline", "yielding"), |b| {
        b.iter(|| run_pipeline(YieldingWaitStrategy::new()));
    });
    group.bench_function(BenchmarkId::new("ringline", "sleeping"), |b| {
        b.iter(|| run_pipeline(SleepingWaitStrategy::new()));
    });
    group.bench_function(BenchmarkId::new("ringline", "blocking"), |b| {
        b.iter(|| run_pipeline(BlockingWaitStrategy::new()));
    });

    group.bench_function(BenchmarkId::new("crossbeam_channel", "bounded"), |b| {
        b.iter(|| {
            let (tx, rx) = crossbeam::channel::bounded::<i64>(CAPACITY);
            let consumer = std::thread::spawn(move || {
                let mut last = -1;
                while let Ok(value) = rx.recv() {
                    last = value;
                }
                last
            });
            for value in 0..EVENTS {
                tx.send(value).unwrap();
            }
            drop(tx);
            assert_eq!(consumer.join().unwrap(), EVENTS - 1);
        });
    });

    group.finish();
}

fn bench_batch_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_batch_publish");
    group.throughput(Throughput::Elements(EVENTS as u64));
    group.sample_size(10);

    for batch in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let mut engine = Engine::new(
                    DefaultEventFactory::<BenchEvent>::new(),
                    CAPACITY,
                    ProducerMode::Single,
                    BusySpinWaitStrategy::new(),
                )
                .unwrap()
                .handle_events_with(|_: &mut BenchEvent, _: i64, _: bool| Ok(()))
                .build();

                engine.start().unwrap();
                let mut producer = engine.producer().unwrap();
                let mut next = 0i64;
                for _ in 0..(EVENTS / batch as i64) {
                    producer.batch_publish(batch, |iter| {
                        for event in iter {
                            event.value = next;
                            next += 1;
                        }
                    });
                }
                engine.drain();
                engine.shutdown().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_wait_strategies, bench_batch_publish);
criterion_main!(benches);
