//! Stress test - watch churn under a live dispatcher
//!
//! Several mutator threads repeatedly add a watch, trigger it, and remove
//! it again (twice, to exercise the no-op path) while the dispatcher's
//! threads are busy dispatching the same watches. A resizer thread grows
//! and shrinks the pool meanwhile.
//!
//! Usage:
//!     ./target/release/stress [iterations] [mutators] [threads]

use fdmux::{MultiplexingDispatchable, ThreadedDispatcher};

use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== fdmux Stress Test ===\n");

    let mut args = std::env::args().skip(1);
    let iterations: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let mutators: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(4);
    let threads: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(4).max(1);

    println!("Iterations: {} per mutator", iterations);
    println!("Mutators:   {}", mutators);
    println!("Threads:    {}\n", threads);

    let watches = Arc::new(MultiplexingDispatchable::new()?);
    let dispatcher = Arc::new(ThreadedDispatcher::new("stress-io", watches.clone())?);
    for _ in 1..threads {
        dispatcher.add_thread()?;
    }

    let fired = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let mutator_handles: Vec<_> = (0..mutators)
        .map(|m| {
            let (watches, fired) = (watches.clone(), fired.clone());
            thread::spawn(move || -> Result<(), BoxError> {
                for i in 0..iterations {
                    let (watched, mut trigger) = UnixStream::pair()?;
                    watched.set_nonblocking(true)?;
                    let counter = fired.clone();
                    let watch = watches.add_watch_fd(OwnedFd::from(watched), move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })?;
                    let _ = trigger.write_all(&[0]);
                    if i % 2 == m % 2 {
                        thread::yield_now();
                    }
                    watches.remove_watch(&watch)?;
                    watches.remove_watch(&watch)?;
                }
                Ok(())
            })
        })
        .collect();

    let resizing = Arc::new(AtomicBool::new(true));
    let resizer = {
        let (dispatcher, resizing) = (dispatcher.clone(), resizing.clone());
        thread::spawn(move || -> Result<u64, BoxError> {
            let mut cycles = 0;
            while resizing.load(Ordering::Relaxed) {
                dispatcher.add_thread()?;
                thread::sleep(Duration::from_millis(5));
                dispatcher.remove_thread()?;
                cycles += 1;
            }
            Ok(cycles)
        })
    };

    let mut failures = 0;
    for handle in mutator_handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                println!("Mutator failed: {}", e);
                failures += 1;
            }
            Err(_) => {
                println!("Mutator panicked");
                failures += 1;
            }
        }
    }
    resizing.store(false, Ordering::Relaxed);
    let cycles = match resizer.join() {
        Ok(Ok(cycles)) => cycles,
        Ok(Err(e)) => {
            println!("Resizer failed: {}", e);
            failures += 1;
            0
        }
        Err(_) => {
            println!("Resizer panicked");
            failures += 1;
            0
        }
    };
    let elapsed = start.elapsed();

    println!("=== Results ===");
    println!("Watches added:   {}", iterations * mutators);
    println!("Callbacks fired: {}", fired.load(Ordering::Relaxed));
    println!("Watches left:    {}", watches.len());
    println!("Resize cycles:   {}", cycles);
    println!("Pool threads:    {}", dispatcher.thread_count());
    println!("Time:            {:?}", elapsed);

    if failures > 0 || !watches.is_empty() {
        std::process::exit(1);
    }
    println!("\n=== Stress Test Complete ===");
    Ok(())
}
