use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use vmthread_core::{value, Services};
use vmthread_runtime::{safepoint, RuntimeConfig, ThreadCoordinator, ThreadOptions};

fn bench_poll_fast_path(c: &mut Criterion) {
    c.bench_function("poll_fast_path", |b| {
        b.iter(|| std::hint::black_box(safepoint::poll()));
    });
}

fn bench_pause_and_execute(c: &mut Criterion) {
    let coordinator = ThreadCoordinator::new(RuntimeConfig::new(), Services::default()).unwrap();
    let running = Arc::new(AtomicBool::new(true));

    let target = coordinator
        .create(ThreadOptions::new().name("spinner"), {
            let running = Arc::clone(&running);
            move || {
                while running.load(Ordering::Relaxed) {
                    safepoint::poll()?;
                    std::hint::spin_loop();
                }
                Ok(value(()))
            }
        })
        .unwrap();
    let context = target.fibers().current_context().unwrap();

    c.bench_function("pause_and_execute_round_trip", |b| {
        b.iter(|| {
            let ran = coordinator
                .safepoint()
                .pause_and_execute(&context, |paused| {
                    std::hint::black_box(paused.requester);
                    Ok(())
                })
                .unwrap();
            assert!(ran);
        });
    });

    running.store(false, Ordering::Relaxed);
    let _ = coordinator.join(&target, None);
}

fn bench_sleep_wakeup(c: &mut Criterion) {
    let coordinator = ThreadCoordinator::new(RuntimeConfig::new(), Services::default()).unwrap();
    let running = Arc::new(AtomicBool::new(true));

    let target = coordinator
        .create(ThreadOptions::new().name("sleeper"), {
            let running = Arc::clone(&running);
            move || {
                let coordinator = vmthread_runtime::current_coordinator().unwrap();
                while running.load(Ordering::Relaxed) {
                    coordinator.sleep(None)?;
                }
                Ok(value(()))
            }
        })
        .unwrap();

    c.bench_function("wakeup", |b| {
        b.iter(|| coordinator.wakeup(&target).unwrap());
    });

    running.store(false, Ordering::Relaxed);
    let _ = coordinator.wakeup(&target);
    let _ = coordinator.join(&target, None);
}

criterion_group!(benches, bench_poll_fast_path, bench_pause_and_execute, bench_sleep_wakeup);
criterion_main!(benches);
