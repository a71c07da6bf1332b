// Throughput benchmarks for the lock-free queue backends.
// Compares single-thread push/pop cost on a bare Msq against a federated
// Lldd<Msq<_>> under increasing producer counts.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lockfree_cds::{lcrq::Lcrq, lldd::BackendHandle, msq::Msq, Lldd};
use std::thread;

fn bench_msq_single_thread(c: &mut Criterion) {
    c.bench_function("msq_push_pop_single_thread", |b| {
        let queue: Msq<u64> = Msq::new();
        b.iter(|| {
            queue.push(black_box(1));
            let mut out = None;
            queue.pop(&mut out);
            black_box(out);
        });
    });
}

fn bench_lcrq_single_thread(c: &mut Criterion) {
    c.bench_function("lcrq_push_pop_single_thread", |b| {
        let queue: Lcrq = Lcrq::new();
        b.iter(|| {
            queue.push(black_box(1));
            let mut out = 0u64;
            queue.pop(&mut out);
            black_box(out);
        });
    });
}

fn bench_lldd_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("lldd_over_msq_producers");

    for producers in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("producers", producers),
            &producers,
            |b, &producers| {
                let lldd: Lldd<Msq<u64>> = Lldd::new(producers + 1).unwrap();
                b.iter(|| {
                    thread::scope(|scope| {
                        for _ in 0..producers {
                            scope.spawn(|| {
                                let mut local = BackendHandle::new();
                                for i in 0..1000u64 {
                                    lldd.put(&mut local, black_box(i));
                                }
                                lldd.deregister_thread(&mut local);
                            });
                        }
                    });

                    let mut local = BackendHandle::new();
                    let mut drained = 0;
                    let mut out = None;
                    while lldd.get(&mut local, &mut out) {
                        drained += 1;
                        black_box(out.take());
                    }
                    lldd.deregister_thread(&mut local);
                    black_box(drained);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_msq_single_thread,
    bench_lcrq_single_thread,
    bench_lldd_scaling
);
criterion_main!(benches);
