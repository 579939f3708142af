use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keyqueue::{KeyQueue, QueueConfig, Release};

/// Runs producers and unreliable consumers against one queue and checks that
/// every pushed message is acknowledged exactly once, in per-key order.
#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(long, default_value_t = 3)]
    producers: usize,
    #[clap(long, default_value_t = 3)]
    consumers: usize,
    #[clap(long, default_value_t = 500)]
    messages_per_producer: u64,
    #[clap(long, default_value_t = 100)]
    lease_ms: u64,
    /// Consumers abandon one in this many claims.
    #[clap(long, default_value_t = 5)]
    crash_every: u64,
    #[clap(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    println!("Starting keyqueue simulation...");

    let cfg = QueueConfig::builder()
        .lease_window(Duration::from_millis(opts.lease_ms))
        .reap_interval(Duration::from_millis((opts.lease_ms / 4).max(1)))
        .build()?;
    let (queue, reaper) = KeyQueue::<String, u64>::with_reaper(cfg)?;

    let producers_done = Arc::new(AtomicBool::new(false));
    // key -> acknowledged messages, in acknowledgment order
    let acknowledged: Arc<Mutex<HashMap<String, Vec<u64>>>> = Arc::new(Mutex::new(HashMap::new()));
    let deadline = Instant::now() + Duration::from_secs(opts.timeout_secs);

    let producer_threads: Vec<_> = (0..opts.producers)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            let count = opts.messages_per_producer;
            thread::spawn(move || {
                for seq in 0..count {
                    queue.push(format!("producer-{}/key-{}", producer, seq % 7), seq);
                    thread::sleep(Duration::from_micros(200));
                }
                println!("[Producer {}] pushed {} messages", producer, count);
            })
        })
        .collect();

    let consumer_threads: Vec<_> = (0..opts.consumers)
        .map(|consumer| {
            let queue = Arc::clone(&queue);
            let producers_done = Arc::clone(&producers_done);
            let acknowledged = Arc::clone(&acknowledged);
            let crash_every = opts.crash_every.max(1);
            thread::spawn(move || {
                let mut abandoned = 0usize;
                while Instant::now() < deadline {
                    let pack = match queue.claim() {
                        Ok(pack) => pack,
                        Err(_) => {
                            if producers_done.load(Ordering::Acquire) && queue.stored_message_count() == 0 {
                                break;
                            }
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                    };
                    if pack.token.value() % crash_every == 0 {
                        abandoned += 1;
                        continue;
                    }
                    // Record before acknowledging so no later claim of the key can overtake.
                    let mut acked = acknowledged.lock();
                    if queue.acknowledge(&pack.key, pack.token) != Release::Stale {
                        acked.entry(pack.key).or_default().extend(pack.messages);
                    }
                }
                println!("[Consumer {}] abandoned {} claims", consumer, abandoned);
            })
        })
        .collect();

    for t in producer_threads {
        t.join().map_err(|_| "producer thread panicked")?;
    }
    producers_done.store(true, Ordering::Release);
    for t in consumer_threads {
        t.join().map_err(|_| "consumer thread panicked")?;
    }
    reaper.shutdown();

    let acknowledged = acknowledged.lock();
    let mut received = 0u64;
    let mut in_order = true;
    for (key, messages) in acknowledged.iter() {
        received += messages.len() as u64;
        if !messages.windows(2).all(|w| w[0] < w[1]) {
            eprintln!("[Main] {} acknowledged out of order: {:?}", key, messages);
            in_order = false;
        }
    }

    let sent = opts.producers as u64 * opts.messages_per_producer;
    info!(sent, received, stats = ?queue.stats(), "simulation finished");
    if received == sent && in_order {
        println!("\nSimulation successful! All {} messages acknowledged exactly once.", sent);
        Ok(())
    } else {
        eprintln!("\nSimulation failed. Sent: {}, acknowledged: {}", sent, received);
        Err("simulation failed".into())
    }
}
