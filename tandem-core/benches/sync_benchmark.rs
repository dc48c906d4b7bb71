use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use tandem_core::{Operation, SyncEngine};

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("local_insert_append", |b| {
        // Appends to an ever-growing document.
        let engine = SyncEngine::new("bench", "alice", "").unwrap();
        b.iter(|| {
            let end = engine.len();
            black_box(engine.insert(end, black_box("x")).unwrap());
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    let source = SyncEngine::new("bench", "alice", "").unwrap();
    for i in 0..100 {
        source.insert(i, "a").unwrap();
    }
    let update = source.state_update(None).unwrap();

    group.bench_function("apply_remote_update_100_chars", |b| {
        // Same update on the same replica: measures the idempotent path.
        let dest = SyncEngine::new("bench", "bob", "").unwrap();
        b.iter(|| {
            dest.apply_update(black_box(&update), "alice").unwrap();
        })
    });

    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let ops: Vec<Operation> = (0..64).map(|_| Operation::insert(0, "ab")).collect();

    c.bench_function("apply_batch_64_inserts", |b| {
        b.iter(|| {
            let engine = SyncEngine::new("bench", "alice", "seed").unwrap();
            black_box(engine.apply_batch(black_box(&ops), "alice").unwrap());
        })
    });
}

fn bench_state_diff(c: &mut Criterion) {
    let a = SyncEngine::new("bench", "alice", "").unwrap();
    let b = SyncEngine::new("bench", "bob", "").unwrap();
    for i in 0..1000 {
        a.insert(i, "z").unwrap();
    }
    b.merge_with(&a).unwrap();
    a.insert(0, "new").unwrap();
    let sv = b.state_vector().unwrap();

    c.bench_function("state_update_against_vector_1k", |bench| {
        bench.iter(|| black_box(a.state_update(Some(black_box(&sv))).unwrap()))
    });
}

criterion_group!(benches, bench_local_insert, bench_apply_remote, bench_batch, bench_state_diff);
criterion_main!(benches);
