use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use portcullis::connection::{Connection, DropReason};
use portcullis::connection_manager::ConnectionManager;
use portcullis::timer::TimerWheel;

#[derive(Default)]
struct BenchConn;

impl Connection for BenchConn {
    fn is_busy(&self) -> bool {
        false
    }
    fn notify_pending_shutdown(&mut self) {}
    fn close_when_idle(&mut self) {}
    fn drop_connection(&mut self, _reason: DropReason) {}
}

fn populated_idle_manager(n: usize) -> (ConnectionManager<BenchConn>, TimerWheel) {
    let mut wheel = TimerWheel::new();
    let mut mgr: ConnectionManager<BenchConn> = ConnectionManager::new(Duration::from_millis(100));
    for _ in 0..n {
        let key = mgr.add(BenchConn, false, &mut wheel);
        mgr.on_deactivated(key);
    }
    (mgr, wheel)
}

fn bench_idle_drop(c: &mut Criterion) {
    c.bench_function("drop_idle_connections_walk_10k", |b| {
        b.iter_batched(
            || populated_idle_manager(10_000),
            |(mut mgr, mut wheel)| {
                black_box(mgr.drop_idle_connections(10_000, &mut wheel));
            },
            criterion::BatchSize::LargeInput,
        )
    });

    c.bench_function("on_activated_on_deactivated_cycle", |b| {
        let (mut mgr, _wheel) = populated_idle_manager(1);
        let key = 0;
        b.iter(|| {
            mgr.on_activated(black_box(key));
            mgr.on_deactivated(black_box(key));
        });
    });
}

criterion_group!(benches, bench_idle_drop);
criterion_main!(benches);
