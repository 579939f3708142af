use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keyqueue::{KeyQueue, QueueConfig, Release};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "keyqueue-claim.toml")]
    config: String,
    #[clap(long, default_value_t = 4)]
    consumers: usize,
    #[clap(long, default_value_t = 100_000)]
    keys: usize,
    #[clap(long, default_value_t = 1_000_000)]
    messages: usize,
    /// Drop every Nth claim without acknowledging it (0 disables).
    #[clap(long, default_value_t = 0)]
    abandon_every: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ClaimBenchConfig {
    queue: QueueConfig,
}

struct ConsumerContext {
    claims: AtomicUsize,
    acknowledged: AtomicUsize,
    abandoned: AtomicUsize,
    stale: AtomicUsize,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ClaimBenchConfig = confy::load_path(&opts.config)?;
    info!(config = ?cfg, "loaded claim bench config");

    let closing = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&closing))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&closing))?;

    let (queue, reaper) = KeyQueue::<String, Vec<u8>>::with_reaper(cfg.queue)?;
    for n in 0..opts.messages {
        queue.push(format!("key-{}", n % opts.keys.max(1)), n.to_le_bytes().to_vec());
    }
    info!(messages = opts.messages, keys = queue.stats().keys, "queue filled");

    let result = run(&queue, &opts, &closing);
    reaper.shutdown();
    result
}

fn run(
    queue: &Arc<KeyQueue<String, Vec<u8>>>,
    opts: &Opts,
    closing: &Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    let ctx = Arc::new(ConsumerContext {
        claims: AtomicUsize::new(0),
        acknowledged: AtomicUsize::new(0),
        abandoned: AtomicUsize::new(0),
        stale: AtomicUsize::new(0),
    });
    let start = Instant::now();

    let handles: Vec<_> = (0..opts.consumers)
        .map(|consumer| {
            let queue = Arc::clone(queue);
            let ctx = Arc::clone(&ctx);
            let closing = Arc::clone(closing);
            let abandon_every = opts.abandon_every;
            thread::Builder::new()
                .name(format!("consumer-{}", consumer))
                .spawn(move || consume(&queue, &ctx, &closing, abandon_every))
        })
        .collect::<Result<_, _>>()?;

    for handle in handles {
        handle.join().map_err(|_| "consumer thread panicked")?;
    }

    let duration = start.elapsed();
    let acknowledged = ctx.acknowledged.load(Ordering::Relaxed);
    let iops = ((acknowledged as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages acknowledged/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    println!(
        "claims: {}, acknowledged messages: {}, abandoned claims: {}, stale acks: {}",
        ctx.claims.load(Ordering::Relaxed),
        acknowledged,
        ctx.abandoned.load(Ordering::Relaxed),
        ctx.stale.load(Ordering::Relaxed),
    );
    if closing.load(Ordering::Relaxed) {
        warn!(left = queue.stored_message_count(), "interrupted before the queue drained");
    }
    Ok(())
}

fn consume(
    queue: &KeyQueue<String, Vec<u8>>,
    ctx: &ConsumerContext,
    closing: &AtomicBool,
    abandon_every: usize,
) {
    while !closing.load(Ordering::Relaxed) {
        let pack = match queue.claim() {
            Ok(pack) => pack,
            Err(_) if queue.stored_message_count() == 0 => break,
            Err(_) => {
                // Everything left is claimed; wait for acks or the reaper.
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };
        let claims = ctx.claims.fetch_add(1, Ordering::Relaxed) + 1;
        if abandon_every > 0 && claims % abandon_every == 0 {
            ctx.abandoned.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        match queue.acknowledge(&pack.key, pack.token) {
            Release::Stale => {
                ctx.stale.fetch_add(1, Ordering::Relaxed);
            }
            Release::Drained | Release::Requeued => {
                let done = ctx.acknowledged.fetch_add(pack.len(), Ordering::Relaxed) + pack.len();
                if claims % 100_000 == 0 {
                    eprint!("\rTotal {} claims ({} messages acknowledged)", claims, done);
                }
            }
        }
    }
}
