//! Store throughput benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use emberkv::storage::{ExpireOption, Store};
use std::sync::Arc;
use std::time::Duration;

fn bench_set(c: &mut Criterion) {
    let store = Store::new();

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            store.set(Bytes::from(format!("key:{}", i)), Bytes::from("small_value"));
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(1024));
        b.iter(|| {
            store.set(Bytes::from(format!("key:{}", i)), value.clone());
            i += 1;
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let store = Store::new();
    for i in 0..100_000 {
        store.set(
            Bytes::from(format!("key:{}", i)),
            Bytes::from(format!("value:{}", i)),
        );
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 100_000));
            black_box(store.get(&key).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("missing:{}", i));
            black_box(store.get(&key).unwrap());
            i += 1;
        });
    });

    group.finish();
}

fn bench_incr(c: &mut Criterion) {
    let store = Store::new();

    let mut group = c.benchmark_group("incr");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_counter", |b| {
        let key = Bytes::from("counter");
        b.iter(|| {
            black_box(store.incr(&key).unwrap());
        });
    });

    group.bench_function("spread_counters", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("counter:{}", i % 1000));
            black_box(store.incr(&key).unwrap());
            i += 1;
        });
    });

    group.finish();
}

fn bench_lists(c: &mut Criterion) {
    let store = Store::new();

    let mut group = c.benchmark_group("lists");
    group.throughput(Throughput::Elements(1));

    group.bench_function("rpush_then_lpop", |b| {
        let key = Bytes::from("queue");
        b.iter(|| {
            store.rpush(&key, vec![Bytes::from("job")]).unwrap();
            black_box(store.lpop(&key, 1).unwrap());
        });
    });

    let key = Bytes::from("window");
    store
        .rpush(&key, (0..1000).map(|i| Bytes::from(i.to_string())).collect())
        .unwrap();
    group.bench_function("lrange_100", |b| {
        b.iter(|| {
            black_box(store.lrange(&key, 0, 99).unwrap());
        });
    });

    group.finish();
}

fn bench_expire(c: &mut Criterion) {
    let store = Store::new();
    for i in 0..10_000 {
        store.set(Bytes::from(format!("key:{}", i)), Bytes::from("value"));
    }

    let mut group = c.benchmark_group("expire");
    group.throughput(Throughput::Elements(1));

    group.bench_function("expire_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 10_000));
            black_box(store.expire(&key, 3600, ExpireOption::Always));
            i += 1;
        });
    });

    group.bench_function("ttl_query", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 10_000));
            black_box(store.ttl(&key));
            i += 1;
        });
    });

    group.finish();
}

fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let store = Arc::new(Store::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            store.set(key.clone(), Bytes::from("value"));
                            store.get(&key).unwrap();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(store.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_incr,
    bench_lists,
    bench_expire,
    bench_concurrent,
);

criterion_main!(benches);
