// Benchmarks for FlowTable performance
// Measures batch staging, confirmation and lookup throughput

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use flowstore_api::{FlowEntryState, FlowRule};
use flowstore_common::{ApplicationId, DeviceId};
use flowstore_store::FlowTable;

fn rules(device: &str, count: u32) -> Vec<FlowRule> {
    (0..count)
        .map(|i| {
            FlowRule::builder(DeviceId::new(device), ApplicationId::new(1, "bench"))
                .payload(format!("in_port={i},actions=output:{}", i % 48).into_bytes())
                .priority(i)
                .build()
        })
        .collect()
}

fn bench_stage_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_batch");

    for size in [10u32, 100, 1000] {
        let batch = rules("of:1", size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                let table = FlowTable::new();
                table.write(&DeviceId::new("of:1"), |shard| {
                    for rule in batch {
                        black_box(shard.apply_add(rule));
                    }
                });
            })
        });
    }

    group.finish();
}

fn bench_duplicate_add(c: &mut Criterion) {
    let table = FlowTable::new();
    let batch = rules("of:1", 1000);
    for rule in &batch {
        table.apply_add(rule);
    }

    c.bench_function("duplicate_add_1000", |b| {
        b.iter(|| {
            for rule in &batch {
                black_box(table.apply_add(rule));
            }
        })
    });
}

fn bench_lookup(c: &mut Criterion) {
    let table = FlowTable::new();
    let batch = rules("of:1", 1000);
    for rule in &batch {
        table.apply_add(rule);
        table.confirm_added(rule);
    }

    c.bench_function("lookup_hit", |b| {
        b.iter(|| black_box(table.lookup(&batch[500]).map(|e| e.state() == FlowEntryState::Added)))
    });

    c.bench_function("snapshot_1000", |b| {
        b.iter(|| black_box(table.snapshot(&DeviceId::new("of:1")).len()))
    });
}

criterion_group!(benches, bench_stage_batch, bench_duplicate_add, bench_lookup);
criterion_main!(benches);
