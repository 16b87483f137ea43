//! Hot-path cost of one trigger + one aggregate dispatch, by watch count.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fdmux_core::{Dispatchable, FdEvents};
use fdmux_runtime::MultiplexingDispatchable;

use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiplexing_dispatch");

    for watches in [1usize, 64, 1024] {
        let aggregate = MultiplexingDispatchable::new().unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        let mut triggers = Vec::with_capacity(watches);
        for _ in 0..watches {
            let (watched, trigger) = UnixStream::pair().unwrap();
            watched.set_nonblocking(true).unwrap();
            let counter = fired.clone();
            aggregate
                .add_watch_fd(OwnedFd::from(watched), move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            triggers.push(trigger);
        }

        let mut next = 0;
        group.bench_with_input(BenchmarkId::from_parameter(watches), &watches, |b, &n| {
            b.iter(|| {
                (&triggers[next]).write_all(&[0]).unwrap();
                next = (next + 1) % n;
                black_box(aggregate.dispatch(FdEvents::READABLE))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
