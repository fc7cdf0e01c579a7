//! Basic VMThread example
//!
//! Spawns a few guest threads, joins them for their values, and shows a
//! failure surfacing in the joiner.
//!
//! # Environment Variables
//!
//! - `VMT_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `VMT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::time::Duration;

use vmthread::{kdebug, kinfo, value, GuestException, Priority, Runtime, RuntimeConfig, Services};
use vmthread::{ThreadOptions, Unwind};

// VMT_LOG_LEVEL=debug VMT_FLUSH_EPRINT=1 cargo run -p vmthread-basic
fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== VMThread Basic Example ===\n");

    let config = RuntimeConfig::from_env().default_priority(Priority::Normal);
    let runtime = Runtime::new(config, Services::default())?;
    kinfo!("Runtime started, main thread {}", runtime.main_thread());

    // Three workers computing partial sums
    let workers: Vec<_> = (1..=3u64)
        .map(|i| {
            vmthread::spawn_with(ThreadOptions::new().name(format!("sum-{}", i)), move || {
                kdebug!("[sum-{}] Started", i);
                let mut acc = 0u64;
                for n in 0..(i * 1_000) {
                    vmthread::safepoint!();
                    acc += n;
                }
                vmthread::sleep(Some(Duration::from_millis(10 * i)))?;
                kdebug!("[sum-{}] Finished", i);
                Ok(value(acc))
            })
        })
        .collect::<Result<_, _>>()?;

    for t in vmthread::list() {
        println!("  {}", t);
    }

    println!();
    for t in &workers {
        let v = t.value()?;
        println!("{} -> {}", t.name().unwrap_or_default(), v.downcast_ref::<u64>().copied().unwrap_or(0));
    }

    // A failing thread: the joiner sees the exception
    let failing = vmthread::spawn(|| {
        Err(Unwind::raise(GuestException::new("ZeroDivisionError", "divided by 0")))
    })?;
    match failing.join(None) {
        Ok(_) => println!("\nunexpected success"),
        Err(unwind) => println!("\njoin re-raised: {}", unwind),
    }
    println!("status: {:?}", failing.status_report());

    runtime.shutdown()?;
    println!("\n=== Example Complete ===");
    Ok(())
}
