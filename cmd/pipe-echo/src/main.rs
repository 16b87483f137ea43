//! Pipe Echo
//!
//! Serves many socketpair "channels" from one `ThreadedDispatcher`. Each
//! channel's server end is a `Dispatchable` that echoes whatever it reads;
//! one client thread per channel sends numbered messages and checks every
//! reply. Midway through, the pool is grown and then shrunk again.
//!
//! Usage:
//!     cargo build --release -p fdmux-pipe-echo
//!     ./target/release/pipe-echo [channels] [messages] [threads]
//!
//! Logging:
//!     FDMUX_LOG_LEVEL=debug ./target/release/pipe-echo 8 1000 2

use fdmux::{
    kdebug, kinfo, kwarn, DispatchReentrancy, Dispatchable, FdEvents, MultiplexingDispatchable,
    ThreadedDispatcher,
};

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const BUF_SIZE: usize = 4096;

/// Server end of one channel.
struct EchoChannel {
    id: usize,
    stream: UnixStream,
    echoed: Arc<AtomicU64>,
}

impl EchoChannel {
    fn echo(&self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            match (&self.stream).write(rest) {
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Dispatchable for EchoChannel {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        if !events.contains(FdEvents::READABLE) {
            kdebug!("channel {} closed by peer", self.id);
            return false;
        }
        let mut buf = [0u8; BUF_SIZE];
        match (&self.stream).read(&mut buf) {
            Ok(0) => {
                kdebug!("channel {} reached EOF", self.id);
                false
            }
            Ok(n) => match self.echo(&buf[..n]) {
                Ok(()) => {
                    self.echoed.fetch_add(n as u64, Ordering::Relaxed);
                    true
                }
                Err(e) => {
                    kwarn!("channel {}: echo failed: {}", self.id, e);
                    false
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
            Err(e) => {
                kwarn!("channel {}: read failed: {}", self.id, e);
                false
            }
        }
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE | FdEvents::REMOTE_CLOSED
    }
}

/// Client side: send `messages` lines and verify each echo.
fn run_client(id: usize, mut stream: UnixStream, messages: usize) -> io::Result<usize> {
    let mut verified = 0;
    for seq in 0..messages {
        let line = format!("channel {} message {}\n", id, seq);
        stream.write_all(line.as_bytes())?;

        let mut reply = vec![0u8; line.len()];
        stream.read_exact(&mut reply)?;
        if reply != line.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("channel {}: bad echo at message {}", id, seq),
            ));
        }
        verified += 1;
    }
    Ok(verified)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== fdmux Pipe Echo ===\n");

    let mut args = std::env::args().skip(1);
    let channels: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(16);
    let messages: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(1000);
    let threads: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(2).max(1);

    println!("Channels: {}", channels);
    println!("Messages: {} per channel", messages);
    println!("Threads:  {}\n", threads);

    let echoed = Arc::new(AtomicU64::new(0));
    let server = Arc::new(MultiplexingDispatchable::new()?);
    let mut clients = Vec::with_capacity(channels);

    for id in 0..channels {
        let (server_end, client_end) = UnixStream::pair()?;
        server_end.set_nonblocking(true)?;
        let channel = Arc::new(EchoChannel {
            id,
            stream: server_end,
            echoed: echoed.clone(),
        });
        server.add_watch_with(channel, DispatchReentrancy::Sequential)?;
        clients.push(client_end);
    }

    let dispatcher = ThreadedDispatcher::new("echo-io", server.clone())?;
    for _ in 1..threads {
        dispatcher.add_thread()?;
    }
    kinfo!("dispatcher running with {} threads", dispatcher.thread_count());

    let start = Instant::now();
    let handles: Vec<_> = clients
        .into_iter()
        .enumerate()
        .map(|(id, stream)| thread::spawn(move || run_client(id, stream, messages)))
        .collect();

    // Resize under load.
    dispatcher.add_thread()?;
    println!("Grew pool to {} threads", dispatcher.thread_count());
    dispatcher.remove_thread()?;
    println!("Shrank pool to {} threads\n", dispatcher.thread_count());

    let mut verified = 0;
    let mut failures = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(n)) => verified += n,
            Ok(Err(e)) => {
                println!("Client failed: {}", e);
                failures += 1;
            }
            Err(_) => {
                println!("Client panicked");
                failures += 1;
            }
        }
    }
    let elapsed = start.elapsed();

    // Clients are gone; their channels exhaust and drop out.
    drop(dispatcher);

    println!("=== Results ===");
    println!("Verified:   {}/{}", verified, channels * messages);
    println!("Failures:   {}", failures);
    println!("Bytes:      {}", echoed.load(Ordering::Relaxed));
    println!("Time:       {:?}", elapsed);
    println!(
        "Throughput: {:.0} msgs/sec",
        verified as f64 / elapsed.as_secs_f64()
    );

    if failures > 0 {
        std::process::exit(1);
    }
    println!("\n=== Pipe Echo Complete ===");
    Ok(())
}
