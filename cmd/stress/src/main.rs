//! Stress test - many threads, many interrupts
//!
//! Spawns a batch of spinning guest threads and hammers them with
//! concurrent `pause_and_execute` requests from several requester threads,
//! then kills everything and checks every action ran exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use vmthread::{safepoint, value, Runtime, RuntimeConfig, Services};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== VMThread Stress Test ===\n");

    let num_targets: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(16);
    let requests_per_requester: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(2_000);
    let num_requesters = 4u64;

    let config = RuntimeConfig::from_env().thread_stack_size(256 * 1024);
    let runtime = Runtime::new(config, Services::default())?;

    let running = Arc::new(AtomicBool::new(true));
    let start = Instant::now();
    let targets = (0..num_targets)
        .map(|_| {
            let running = Arc::clone(&running);
            vmthread::spawn(move || {
                let mut spins = 0u64;
                while running.load(Ordering::Relaxed) {
                    safepoint!();
                    spins += 1;
                }
                Ok(value(spins))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let spawn_time = start.elapsed();
    println!("Spawned {} targets in {:?}", num_targets, spawn_time);

    let executed = Arc::new(AtomicU64::new(0));
    let run_start = Instant::now();
    let requesters = (0..num_requesters)
        .map(|r| {
            let executed = Arc::clone(&executed);
            let contexts: Vec<_> = targets
                .iter()
                .filter_map(|t| t.record().fibers().current_context())
                .collect();
            vmthread::spawn(move || {
                let coordinator = vmthread::coordinator()?;
                for i in 0..requests_per_requester {
                    let target = &contexts[((r + i) as usize) % contexts.len()];
                    let executed = Arc::clone(&executed);
                    coordinator.safepoint().pause_and_execute(target, move |_| {
                        executed.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    })?;
                }
                Ok(value(()))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for r in &requesters {
        r.join(None)?;
    }
    let run_time = run_start.elapsed();

    running.store(false, Ordering::Relaxed);
    let mut total_spins = 0u64;
    for t in &targets {
        total_spins += t.value()?.downcast_ref::<u64>().copied().unwrap_or(0);
    }

    let expected = num_requesters * requests_per_requester;
    let stats = runtime.stats();

    println!("\n=== Results ===");
    println!("Targets:         {}", num_targets);
    println!("Requests:        {}", expected);
    println!("Executed:        {}", executed.load(Ordering::Relaxed));
    println!("Target spins:    {}", total_spins);
    println!("Slow polls:      {}", stats.slow_polls);
    println!("Run time:        {:?}", run_time);
    println!("Throughput:      {:.0} pauses/sec", expected as f64 / run_time.as_secs_f64());

    runtime.shutdown()?;

    if executed.load(Ordering::Relaxed) != expected {
        return Err(format!("expected {} actions, {} ran", expected, executed.load(Ordering::Relaxed)).into());
    }
    println!("\n=== Stress Test Complete ===");
    Ok(())
}
