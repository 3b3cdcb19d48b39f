use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use siltdb::{Options, DB};
use tempfile::TempDir;

const KEYS: u64 = 100_000;

fn populated_db(dir: &TempDir) -> DB {
    let db = DB::open(
        dir.path(),
        Options::default().create_if_missing(true).write_buffer_size(1 << 20),
    )
    .unwrap();
    for i in 0..KEYS {
        let key = format!("key{:016}", i);
        db.put(key.as_bytes(), b"value-payload-100-bytes").unwrap();
    }
    // Push everything into tables so reads exercise the full path.
    db.compact_range(None, None).unwrap();
    db
}

fn bench_point_get(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = populated_db(&dir);

    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Elements(1));
    let mut i = 0u64;
    group.bench_function("point_get_hit", |b| {
        b.iter(|| {
            let key = format!("key{:016}", (i * 7919) % KEYS);
            i += 1;
            assert!(db.get(key.as_bytes()).unwrap().is_some());
        })
    });
    group.bench_function("point_get_miss", |b| {
        b.iter(|| {
            let key = format!("missing{:016}", i);
            i += 1;
            assert!(db.get(key.as_bytes()).unwrap().is_none());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_point_get);
criterion_main!(benches);
