//! Asynchronous interrupt demo
//!
//! Shows kill and raise arriving at safepoints, `handle_interrupt` holding
//! them back, and `wakeup` cutting a sleep short.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vmthread::{kinfo, safepoint, value, GuestException, Runtime, ThreadStatus};

fn wait_until_sleeping(t: &vmthread::Thread) {
    while t.status() != ThreadStatus::Sleep {
        std::thread::yield_now();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== VMThread Interrupts ===\n");
    let runtime = Runtime::from_env()?;

    // 1. Kill a busy loop
    let iterations = Arc::new(AtomicU64::new(0));
    let busy = vmthread::spawn({
        let iterations = Arc::clone(&iterations);
        move || loop {
            safepoint!();
            iterations.fetch_add(1, Ordering::Relaxed);
        }
    })?;
    vmthread::sleep(Some(Duration::from_millis(20)))?;
    busy.kill()?;
    let outcome = busy.join(None);
    println!(
        "kill busy loop: {} after {} iterations",
        if outcome.is_err() { "killed" } else { "finished?" },
        iterations.load(Ordering::Relaxed)
    );

    // 2. Raise inside a sleeping thread; the backtrace comes from the target
    let sleeper = vmthread::spawn(|| {
        vmthread::sleep(None)?;
        Ok(value(()))
    })?;
    wait_until_sleeping(&sleeper);
    sleeper.raise(GuestException::new("Interrupt", "stop sleeping"))?;
    if let Err(unwind) = sleeper.join(None) {
        let frames = unwind
            .exception()
            .and_then(|e| e.backtrace())
            .map_or(0, |bt| bt.frames().len());
        println!("raise in sleeper: {} ({} frames captured on target)", unwind, frames);
    }

    // 3. Critical section under :never; the kill waits for the scope to end
    let release = Arc::new(AtomicBool::new(false));
    let critical = vmthread::spawn({
        let release = Arc::clone(&release);
        move || {
            vmthread::handle_interrupt("Object", ":never", || {
                while !release.load(Ordering::SeqCst) {
                    safepoint!();
                }
                kinfo!("critical section complete");
                Ok(())
            })?;
            Ok(value("unreachable"))
        }
    })?;
    critical.kill()?;
    vmthread::sleep(Some(Duration::from_millis(20)))?;
    println!("critical section alive after kill: {}", critical.is_alive());
    release.store(true, Ordering::SeqCst);
    println!("critical section joined: killed = {}", critical.join(None).is_err());

    // 4. Wakeup ends a sleep early without killing
    let napper = vmthread::spawn(|| {
        let slept = vmthread::sleep(Some(Duration::from_secs(60)))?;
        Ok(value(slept))
    })?;
    wait_until_sleeping(&napper);
    napper.wakeup()?;
    let slept = napper.value()?;
    println!("wakeup: slept {:?} of 60s", slept.downcast_ref::<Duration>().copied().unwrap_or_default());

    let stats = runtime.stats();
    println!(
        "\nsafepoint stats: requested={} executed={} deferred={} skipped={}",
        stats.requested, stats.executed, stats.deferred, stats.skipped
    );

    runtime.shutdown()?;
    println!("\n=== Done ===");
    Ok(())
}
