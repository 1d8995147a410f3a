//! Throughput benchmark for the nearly-wait-free resizable hash map.
//!
//! Measures single-threaded put/get throughput at a few table sizes, and
//! multi-threaded put throughput across a fixed key space to show how much
//! cooperative-resize/CAS contention costs as thread count grows.

use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nwfcore::gc::Collector;
use nwfcore::nwf::NwfMap;

fn bench_single_thread_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("nwf_map_put");

    for &size in &[1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let gc = Collector::new();
                let map: NwfMap<u64, u64> = NwfMap::new(gc);
                for i in 0..size as u64 {
                    map.put(i, i);
                }
                black_box(map.size());
            });
        });
    }

    group.finish();
}

fn bench_single_thread_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("nwf_map_get");

    for &size in &[1_000usize, 10_000, 100_000] {
        let gc = Collector::new();
        let map: NwfMap<u64, u64> = NwfMap::new(gc);
        for i in 0..size as u64 {
            map.put(i, i);
        }

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size as u64 {
                    black_box(map.get(&i));
                }
            });
        });
    }

    group.finish();
}

fn bench_concurrent_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("nwf_map_concurrent_put");

    for &threads in &[1usize, 2, 4, 8] {
        const PER_THREAD: u64 = 20_000;
        group.throughput(Throughput::Elements(threads as u64 * PER_THREAD));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let gc = Collector::new();
                    let map = Arc::new(NwfMap::<u64, u64>::new(gc));

                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let map = Arc::clone(&map);
                            thread::spawn(move || {
                                let base = t as u64 * PER_THREAD;
                                for i in 0..PER_THREAD {
                                    map.put(base + i, i);
                                }
                            })
                        })
                        .collect();

                    for h in handles {
                        h.join().unwrap();
                    }
                    black_box(map.size());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_put,
    bench_single_thread_get,
    bench_concurrent_put
);
criterion_main!(benches);
