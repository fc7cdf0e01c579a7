//! Fiber hand-off scenarios

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use vmthread::{
    safepoint, value, Fiber, GuestException, Parker, Runtime, RuntimeConfig, Services,
    ThreadStatus, Unwind, WaitOutcome,
};

fn runtime() -> Runtime {
    let config = RuntimeConfig::new()
        .report_on_exception(false)
        .shutdown_timeout(Duration::from_secs(2));
    Runtime::new(config, Services::default()).unwrap()
}

fn await_finished(fiber: &Fiber) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    let parker = Arc::new(Parker::new());
    loop {
        match fiber.record().finished_latch().await_on(&parker, Some(deadline)) {
            WaitOutcome::Ready => return true,
            WaitOutcome::TimedOut => return false,
            WaitOutcome::Interrupted => continue,
        }
    }
}

#[test]
fn test_resume_yield_round_trip() {
    let rt = runtime();
    let fiber = Fiber::new(|first| {
        let mut total = *first.downcast_ref::<u64>().unwrap();
        for _ in 0..3 {
            let next = vmthread::fiber_yield(value(total))?;
            total += *next.downcast_ref::<u64>().unwrap();
        }
        Ok(value(format!("total={}", total)))
    })
    .unwrap();

    let mut seen = Vec::new();
    let mut input = 1u64;
    for _ in 0..3 {
        let out = fiber.resume(value(input)).unwrap();
        seen.push(*out.downcast_ref::<u64>().unwrap());
        input *= 10;
    }
    let last = fiber.resume(value(input)).unwrap();

    assert_eq!(seen, vec![1, 11, 111]);
    assert_eq!(last.downcast_ref::<String>().map(String::as_str), Some("total=1111"));
    assert!(await_finished(&fiber));
    assert!(!fiber.is_alive());
    assert!(fiber.record().native_context().is_none());

    let main = vmthread::current().unwrap();
    assert!(main.current_fiber().is_root());
    assert!(fiber.resume(value(0u64)).is_err());
    rt.shutdown().unwrap();
}

#[test]
fn test_fiber_exception_reaches_resumer() {
    let rt = runtime();
    let fiber = Fiber::new(|_| Err(Unwind::raise(GuestException::new("StopIteration", "empty"))))
        .unwrap();

    let err = fiber.resume(value(())).unwrap_err();
    assert_eq!(err.exception().unwrap().class(), "StopIteration");
    assert!(vmthread::current().unwrap().current_fiber().is_root());
    rt.shutdown().unwrap();
}

#[test]
fn test_fiber_locals_are_per_fiber() {
    let rt = runtime();
    let me = vmthread::current().unwrap();
    me.set_fiber_local("request", value(1i32));

    let fiber = Fiber::new(|_| {
        let me = vmthread::current().expect("attached");
        assert!(!me.current_fiber().is_root());
        let inherited = me.fiber_local("request").is_some();
        me.set_fiber_local("request", value(2i32));
        vmthread::fiber_yield(value(inherited))?;
        Ok(value(me.fiber_local_keys()))
    })
    .unwrap();

    let inherited = fiber.resume(value(())).unwrap();
    assert_eq!(inherited.downcast_ref::<bool>(), Some(&false));
    assert_eq!(me.fiber_local("request").unwrap().downcast_ref::<i32>(), Some(&1));

    let keys = fiber.resume(value(())).unwrap();
    assert_eq!(keys.downcast_ref::<Vec<String>>().unwrap(), &vec!["request".to_string()]);
    rt.shutdown().unwrap();
}

#[test]
fn test_yield_from_root_and_cross_thread_resume_fail() {
    let rt = runtime();
    assert!(vmthread::fiber_yield(value(())).is_err());

    let fiber = Fiber::new(|v| Ok(v)).unwrap();
    let outsider = vmthread::spawn({
        let fiber = fiber.clone();
        move || Ok(value(fiber.resume(value(())).is_err()))
    })
    .unwrap();
    assert_eq!(outsider.value().unwrap().downcast_ref::<bool>(), Some(&true));

    // Still resumable by its owner
    let echoed = fiber.resume(value(5u8)).unwrap();
    assert_eq!(echoed.downcast_ref::<u8>(), Some(&5));
    rt.shutdown().unwrap();
}

#[test]
fn test_thread_exit_terminates_suspended_fiber() {
    let rt = runtime();
    let slot: Arc<Mutex<Option<Fiber>>> = Arc::new(Mutex::new(None));
    let cleaned_up = Arc::new(AtomicBool::new(false));

    let t = vmthread::spawn({
        let (slot, cleaned_up) = (Arc::clone(&slot), Arc::clone(&cleaned_up));
        move || {
            let fiber = Fiber::new(move |_| {
                let outcome = vmthread::fiber_yield(value(()));
                cleaned_up.store(outcome.as_ref().is_err_and(Unwind::is_kill), Ordering::SeqCst);
                outcome
            })?;
            fiber.resume(value(()))?;
            *slot.lock() = Some(fiber);
            vmthread::sleep(None)?;
            Ok(value(()))
        }
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while t.status() != ThreadStatus::Sleep {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    t.kill().unwrap();
    assert!(t.join(None).unwrap_err().exception().unwrap().is_kill());

    let fiber = slot.lock().take().unwrap();
    assert!(await_finished(&fiber));
    assert!(cleaned_up.load(Ordering::SeqCst));
    rt.shutdown().unwrap();
}

#[test]
fn test_kill_reaches_running_fiber() {
    let rt = runtime();
    let spinning = Arc::new(AtomicBool::new(false));

    let t = vmthread::spawn({
        let spinning = Arc::clone(&spinning);
        move || {
            let fiber = Fiber::new(move |_| loop {
                spinning.store(true, Ordering::SeqCst);
                safepoint!();
            })?;
            fiber.resume(value(()))?;
            Ok(value("fiber returned"))
        }
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !spinning.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    assert!(!t.current_fiber().is_root());

    t.kill().unwrap();
    assert!(t.join(None).unwrap_err().exception().unwrap().is_kill());
    rt.shutdown().unwrap();
}

/// Spin in a fiber without polling until released, then leave it
fn spawn_with_busy_fiber(
    started: &Arc<AtomicBool>,
    release: &Arc<AtomicBool>,
    leave: fn() -> vmthread::GuestResult<vmthread::Value>,
) -> vmthread::Thread {
    let (started, release) = (Arc::clone(started), Arc::clone(release));
    vmthread::spawn(move || {
        let fiber = Fiber::new(move |_| {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            leave()
        })?;
        fiber.resume(value(()))?;

        // Back on the root fiber; anything still owed to the thread lands here
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            safepoint!();
        }
        Ok(value("survived"))
    })
    .unwrap()
}

#[test]
fn test_kill_outlives_returning_fiber() {
    let rt = runtime();
    let (started, release) = (Arc::new(AtomicBool::new(false)), Arc::new(AtomicBool::new(false)));
    let t = spawn_with_busy_fiber(&started, &release, || Ok(value("fiber done")));

    let deadline = Instant::now() + Duration::from_secs(10);
    while !started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    assert!(!t.current_fiber().is_root());

    t.kill().unwrap();
    assert_eq!(t.record().pending_interrupts(), 1);
    release.store(true, Ordering::SeqCst);

    let err = t.join(None).unwrap_err();
    assert!(err.exception().unwrap().is_kill());
    assert!(t.record().value().is_none());
    rt.shutdown().unwrap();
}

#[test]
fn test_raise_outlives_yielding_fiber() {
    let rt = runtime();
    let (started, release) = (Arc::new(AtomicBool::new(false)), Arc::new(AtomicBool::new(false)));
    let t = spawn_with_busy_fiber(&started, &release, || vmthread::fiber_yield(value(())));

    let deadline = Instant::now() + Duration::from_secs(10);
    while !started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }

    t.raise(GuestException::new("IOError", "raised during fiber")).unwrap();
    release.store(true, Ordering::SeqCst);

    let err = t.join(None).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.class(), "IOError");
    assert_eq!(exc.message(), "raised during fiber");
    assert!(exc.backtrace().is_some());
    rt.shutdown().unwrap();
}
