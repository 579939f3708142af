use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use keyqueue::{KeyQueue, QueueConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "keyqueue-push.toml")]
    config: String,
    #[clap(long, default_value_t = 4)]
    producers: usize,
    #[clap(long, default_value_t = 1024)]
    keys: usize,
    #[clap(long, default_value_t = 2_500_000)]
    messages_per_producer: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct PushBenchConfig {
    // Same file shape as claim_bench; pushes never consult the lease settings.
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: PushBenchConfig = confy::load_path(&opts.config)?;
    cfg.queue.validate()?;
    info!(config = ?cfg, "loaded push bench config");

    let queue: Arc<KeyQueue<String, Vec<u8>>> = Arc::new(KeyQueue::new(cfg.queue));
    run(&queue, &opts)
}

#[inline]
fn key_for(producer: usize, n: usize, keys: usize) -> String {
    format!("key-{}", (producer + n) % keys.max(1))
}

fn run(queue: &Arc<KeyQueue<String, Vec<u8>>>, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let handles: Vec<_> = (0..opts.producers)
        .map(|producer| {
            let queue = Arc::clone(queue);
            let keys = opts.keys;
            let count = opts.messages_per_producer;
            thread::Builder::new()
                .name(format!("producer-{}", producer))
                .spawn(move || {
                    for n in 0..count {
                        queue.push(key_for(producer, n, keys), n.to_le_bytes().to_vec());
                        if producer == 0 && n % 500_000 == 0 {
                            eprint!("\rTotal {} ops (producer 0)", n);
                        }
                    }
                    count
                })
        })
        .collect::<Result<_, _>>()?;

    let mut called = 0usize;
    for handle in handles {
        called += handle.join().map_err(|_| "producer thread panicked")?;
    }

    let duration = start.elapsed();
    let iops = ((called as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages pushed/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    let stats = queue.stats();
    println!(
        "keys: {}, queued keys: {}, stored messages: {}",
        stats.keys, stats.queued_keys, stats.stored_messages
    );
    Ok(())
}
