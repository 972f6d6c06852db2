//! Criterion benchmarks for write propagation.
//!
//! - **Chain**: one source feeding a long line of derived nodes
//! - **Fan-out**: one source read by many independent derived nodes
//! - **Batch**: many writes coalesced into one transaction
//!
//! Run with: `cargo bench -p lattice-incr`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lattice_incr::{Declarations, Engine, Value};

const SIZES: &[usize] = &[10, 100, 1_000];

fn increment(input: String) -> impl Fn(&mut lattice_incr::Accessor<'_>) -> Result<Value, lattice_incr::ComputeError> {
    move |acc| Ok(Value::from(acc.get(&input)?.as_i64().unwrap_or(0) + 1))
}

fn chain(len: usize) -> Engine {
    let mut decls = Declarations::new().value("n0", 0);
    for i in 1..=len {
        decls = decls.derived(format!("n{i}"), increment(format!("n{}", i - 1)));
    }
    let engine = Engine::new(decls).unwrap();
    engine
        .subscribe(&format!("n{len}"), |v| {
            black_box(v);
        })
        .unwrap()
        .detach();
    engine
}

fn fan_out(width: usize) -> Engine {
    let mut decls = Declarations::new().value("source", 0);
    for i in 0..width {
        decls = decls.derived(format!("leaf{i}"), increment("source".to_string()));
    }
    let engine = Engine::new(decls).unwrap();
    for i in 0..width {
        engine.get(&format!("leaf{i}"));
    }
    engine
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/chain");
    for &len in SIZES {
        let engine = chain(len);
        let mut next = 0i64;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                next += 1;
                engine.set("n0", next).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/fan_out");
    for &width in SIZES {
        let engine = fan_out(width);
        let mut next = 0i64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                next += 1;
                engine.set("source", next).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let engine = chain(100);
    let mut next = 0i64;
    c.bench_function("propagation/batch_100_writes", |b| {
        b.iter(|| {
            engine
                .batch(|| {
                    for _ in 0..100 {
                        next += 1;
                        engine.set("n0", next).unwrap();
                    }
                })
                .unwrap();
            black_box(engine.get("n100"))
        })
    });
}

criterion_group!(benches, bench_chain, bench_fan_out, bench_batch);
criterion_main!(benches);
