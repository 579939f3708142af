use std::fmt::Debug;
use std::hash::Hash;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::coordinator::KeyQueue;
use super::errors::QueueError;

pub static REAPER_THREAD_NAME: &'static str = "keyqueue-reaper";

/// Handle to the background thread that expires overdue claims.
/// Dropping the handle stops the thread and waits for it.
pub struct Reaper {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn<K, M>(queue: Arc<KeyQueue<K, M>>) -> Result<Reaper, QueueError>
    where
        K: Eq + Hash + Clone + Debug + Send + 'static,
        M: Clone + Send + 'static,
    {
        let interval = queue.config().reap_interval();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(REAPER_THREAD_NAME.to_string())
            .spawn(move || run(&*queue, interval, shutdown_rx))?;
        Ok(Reaper {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Disconnecting the channel wakes the loop immediately.
        drop(self.shutdown_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("lease reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<K, M>(queue: &KeyQueue<K, M>, interval: Duration, shutdown_rx: Receiver<()>)
where
    K: Eq + Hash + Clone + Debug,
    M: Clone,
{
    info!(
        interval_ms = interval.as_millis() as u64,
        lease_ms = queue.config().lease_window_ms,
        "lease reaper started"
    );
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                queue.expire_claims(Instant::now());
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("lease reaper stopped");
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::config::QueueConfig;

    fn fast_queue() -> Result<Arc<KeyQueue<String, u32>>, Box<dyn Error>> {
        let cfg = QueueConfig::builder()
            .lease_window(Duration::from_millis(40))
            .reap_interval(Duration::from_millis(10))
            .build()?;
        Ok(Arc::new(KeyQueue::new(cfg)))
    }

    #[test]
    fn abandoned_claim_becomes_claimable_again() -> Result<(), Box<dyn Error>> {
        let queue = fast_queue()?;
        let reaper = Reaper::spawn(Arc::clone(&queue))?;
        assert!(reaper.is_running());

        queue.push("B".to_string(), 7);
        let first = queue.claim()?;
        assert_eq!(queue.active_claim_count(), 1);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(queue.active_claim_count(), 0);

        let second = queue.claim()?;
        assert_eq!(second.key, "B");
        assert_eq!(second.messages, vec![7]);
        assert!(second.token > first.token);
        Ok(())
    }

    #[test]
    fn acknowledged_claim_is_not_touched() -> Result<(), Box<dyn Error>> {
        let queue = fast_queue()?;
        let _reaper = Reaper::spawn(Arc::clone(&queue))?;

        queue.push("A".to_string(), 1);
        let pack = queue.claim()?;
        queue.acknowledge(&pack.key, pack.token);

        thread::sleep(Duration::from_millis(120));
        assert_eq!(queue.stored_message_count(), 0);
        assert!(queue.claim().unwrap_err().is_empty_queue());
        Ok(())
    }

    #[test]
    fn shutdown_stops_thread_promptly() -> Result<(), Box<dyn Error>> {
        let cfg = QueueConfig::builder()
            .lease_window(Duration::from_secs(3600))
            .build()?;
        let queue: Arc<KeyQueue<String, u32>> = Arc::new(KeyQueue::new(cfg));
        let reaper = Reaper::spawn(Arc::clone(&queue))?;

        let start = Instant::now();
        reaper.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(Arc::strong_count(&queue), 1);
        Ok(())
    }
}
