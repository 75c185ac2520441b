//! Throughput benchmarks for the dictionary, set, and queue.
//!
//! Run with: `cargo bench --bench throughput`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use lockfree_collections::{Config, Dictionary, Queue};
use std::sync::Arc;
use std::thread;

const OP_COUNT: u64 = 200_000;

// =============================================================================
// SINGLE-THREADED
// =============================================================================

fn bench_dictionary_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread");
    group.throughput(Throughput::Elements(OP_COUNT));

    group.bench_function("dictionary_insert", |b| {
        b.iter(|| {
            let dict: Dictionary<u64, u64> = Dictionary::with_config(Config::new(1 << 16, 1024, false));
            for i in 0..OP_COUNT {
                dict.try_add(black_box(i), black_box(i)).unwrap();
            }
            dict
        });
    });

    group.bench_function("dictionary_get_hit", |b| {
        let dict: Dictionary<u64, u64> = Dictionary::with_config(Config::new(1 << 16, 1024, false));
        for i in 0..OP_COUNT {
            dict.try_add(i, i).unwrap();
        }
        b.iter(|| {
            for i in 0..OP_COUNT {
                black_box(dict.get(&i));
            }
        });
    });

    group.bench_function("queue_enqueue_dequeue", |b| {
        b.iter(|| {
            let q: Queue<u64> = Queue::new();
            for i in 0..OP_COUNT {
                q.enqueue(black_box(i));
            }
            let mut sum = 0u64;
            while let Some(v) = q.try_dequeue() {
                sum += v;
            }
            sum
        });
    });

    group.finish();
}

// =============================================================================
// CONCURRENT
// =============================================================================

fn bench_dictionary_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent");
    group.throughput(Throughput::Elements(OP_COUNT));

    for readers in [1, 2, 4, 8] {
        group.bench_function(format!("dictionary_get_{readers}_readers"), |b| {
            let dict: Arc<Dictionary<u64, u64>> =
                Arc::new(Dictionary::with_config(Config::new(1 << 16, 1024, false)));
            for i in 0..OP_COUNT {
                dict.try_add(i, i).unwrap();
            }

            b.iter(|| {
                let handles: Vec<_> = (0..readers)
                    .map(|_| {
                        let dict = Arc::clone(&dict);
                        thread::spawn(move || {
                            for i in 0..OP_COUNT / readers as u64 {
                                black_box(dict.get(&i));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.bench_function("queue_mpsc_enqueue", |b| {
        b.iter(|| {
            let q: Arc<Queue<u64>> = Arc::new(Queue::new());
            let handles: Vec<_> = (0..4)
                .map(|p| {
                    let q = Arc::clone(&q);
                    thread::spawn(move || {
                        for i in 0..OP_COUNT / 4 {
                            q.enqueue(black_box(p * (OP_COUNT / 4) + i));
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            q.drain_to_vec().len()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dictionary_single_thread, bench_dictionary_concurrent);
criterion_main!(benches);
