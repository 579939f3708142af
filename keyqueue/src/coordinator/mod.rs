use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::config::QueueConfig;
use super::core::*;
use super::errors::QueueError;
use super::reaper::Reaper;

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub keys: usize,
    pub queued_keys: usize,
    pub active_claims: usize,
    pub stored_messages: usize,
}

/// Key-partitioned FIFO queue with lease-based claims.
///
/// Every operation holds the same lock for its whole duration, so a claim,
/// an acknowledgment and a reaper pass never interleave.
pub struct KeyQueue<K = String, M = Vec<u8>> {
    ledger: Mutex<Ledger<K, M>>,
    config: QueueConfig,
}

impl<K, M> KeyQueue<K, M>
where
    K: Eq + Hash + Clone + Debug,
    M: Clone,
{
    pub fn new(config: QueueConfig) -> KeyQueue<K, M> {
        KeyQueue {
            ledger: Mutex::new(Ledger::new()),
            config,
        }
    }

    /// Builds a shared queue with its lease reaper already running.
    pub fn with_reaper(config: QueueConfig) -> Result<(Arc<KeyQueue<K, M>>, Reaper), QueueError>
    where
        K: Send + 'static,
        M: Send + 'static,
    {
        config.validate()?;
        let queue = Arc::new(KeyQueue::new(config));
        let reaper = Reaper::spawn(Arc::clone(&queue))?;
        Ok((queue, reaper))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Appends `message` to the buffer of `key`. A key seen for the first
    /// time joins the tail of the order queue; a claimed key stays claimed.
    pub fn push(&self, key: K, message: M) {
        self.ledger.lock().push(key, message);
    }

    /// Claims the oldest unclaimed key together with every message it holds now.
    /// Never waits: an empty queue is reported as `QueueError::EmptyQueue`.
    pub fn claim(&self) -> Result<ClaimedPack<K, M>, QueueError> {
        let pack = self
            .ledger
            .lock()
            .claim(Instant::now())
            .ok_or(QueueError::EmptyQueue)?;
        debug!(key = ?pack.key, token = pack.token.value(), messages = pack.len(), "claimed key");
        Ok(pack)
    }

    /// Ends the claim identified by `token`, dropping the messages it covered.
    /// A token that is not the key's current one is ignored.
    pub fn acknowledge(&self, key: &K, token: ClaimToken) -> Release {
        let release = self
            .ledger
            .lock()
            .release(key, token, ClaimEnd::Acknowledged);
        match release {
            Release::Stale => trace!(?key, token = token.value(), "ignored stale acknowledgment"),
            Release::Requeued => debug!(?key, token = token.value(), "acknowledged, key requeued"),
            Release::Drained => debug!(?key, token = token.value(), "acknowledged, key drained"),
        }
        release
    }

    /// Releases every claim held for at least the lease window as of `now`.
    /// Messages of an expired claim stay queued. Returns the number released.
    pub fn expire_claims(&self, now: Instant) -> usize {
        let lease_window = self.config.lease_window();
        let expired: Vec<(K, Release)> = {
            let mut ledger = self.ledger.lock();
            let overdue = ledger.overdue(now, lease_window);
            overdue
                .into_iter()
                .map(|(key, token)| {
                    let release = ledger.release(&key, token, ClaimEnd::Expired);
                    (key, release)
                })
                .filter(|(_, release)| *release != Release::Stale)
                .collect()
        };
        for (key, release) in expired.iter() {
            info!(?key, ?release, lease_ms = self.config.lease_window_ms, "claim lease expired");
        }
        expired.len()
    }

    pub fn active_claim_count(&self) -> usize {
        self.ledger.lock().active_claims()
    }

    pub fn stored_message_count(&self) -> usize {
        self.ledger.lock().stored_messages()
    }

    pub fn queued_key_count(&self) -> usize {
        self.ledger.lock().queued_key_count()
    }

    pub fn stats(&self) -> QueueStats {
        let ledger = self.ledger.lock();
        QueueStats {
            keys: ledger.key_count(),
            queued_keys: ledger.queued_key_count(),
            active_claims: ledger.active_claims(),
            stored_messages: ledger.stored_messages(),
        }
    }

    /// Buffered messages for `key`, claimed prefix included.
    pub fn pending(&self, key: &K) -> Vec<M> {
        self.ledger
            .lock()
            .pack(key)
            .map(|pack| pack.messages().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::time::Duration;

    use super::*;

    fn queue() -> KeyQueue<&'static str, &'static str> {
        KeyQueue::new(QueueConfig::default())
    }

    #[test]
    fn claim_returns_all_messages_of_first_key() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "m1");
        q.push("A", "m2");

        let pack = q.claim()?;
        assert_eq!(pack.key, "A");
        assert_eq!(pack.messages, vec!["m1", "m2"]);
        assert_eq!(q.active_claim_count(), 1);
        Ok(())
    }

    #[test]
    fn acknowledge_keeps_messages_pushed_during_claim() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "m1");
        q.push("A", "m2");
        let pack = q.claim()?;
        q.push("A", "m3");

        assert_eq!(q.acknowledge(&"A", pack.token), Release::Requeued);
        assert_eq!(q.pending(&"A"), vec!["m3"]);
        assert_eq!(q.active_claim_count(), 0);
        assert_eq!(q.queued_key_count(), 1);

        let again = q.claim()?;
        assert_eq!(again.key, "A");
        assert_eq!(again.messages, vec!["m3"]);
        assert_ne!(again.token, pack.token);
        Ok(())
    }

    #[test]
    fn wrong_token_leaves_claim_in_place() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "m1");
        let _pack = q.claim()?;

        assert_eq!(q.acknowledge(&"A", ClaimToken::from_raw(999)), Release::Stale);
        assert_eq!(q.pending(&"A"), vec!["m1"]);
        assert_eq!(q.active_claim_count(), 1);
        assert!(q.claim().unwrap_err().is_empty_queue());
        Ok(())
    }

    #[test]
    fn claim_on_empty_queue_fails_without_side_effects() {
        let q = queue();
        let err = q.claim().unwrap_err();
        assert!(err.is_empty_queue());
        assert_eq!(q.stats(), QueueStats::default());
    }

    #[test]
    fn keys_are_claimed_in_arrival_order() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "m1");
        q.push("B", "m2");
        assert_eq!(q.claim()?.key, "A");
        assert_eq!(q.claim()?.key, "B");
        Ok(())
    }

    #[test]
    fn requeued_key_goes_behind_waiting_keys() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "a1");
        let a = q.claim()?;
        q.push("A", "a2");
        q.push("B", "b1");
        q.acknowledge(&"A", a.token);

        assert_eq!(q.claim()?.key, "B");
        assert_eq!(q.claim()?.key, "A");
        Ok(())
    }

    #[test]
    fn double_acknowledge_is_a_noop() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "m1");
        let pack = q.claim()?;
        assert_eq!(q.acknowledge(&"A", pack.token), Release::Drained);
        assert_eq!(q.acknowledge(&"A", pack.token), Release::Stale);
        assert_eq!(q.stats(), QueueStats::default());
        Ok(())
    }

    #[test]
    fn acknowledge_of_never_claimed_key_is_a_noop() {
        let q = queue();
        q.push("A", "m1");
        assert_eq!(q.acknowledge(&"A", ClaimToken::from_raw(1)), Release::Stale);
        assert_eq!(q.acknowledge(&"Z", ClaimToken::from_raw(1)), Release::Stale);
        assert_eq!(q.queued_key_count(), 1);
        assert_eq!(q.stored_message_count(), 1);
    }

    #[test]
    fn expire_claims_releases_only_overdue_claims() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("B", "x");
        let pack = q.claim()?;

        assert_eq!(q.expire_claims(Instant::now()), 0);
        assert_eq!(q.active_claim_count(), 1);

        let later = Instant::now() + q.config().lease_window();
        assert_eq!(q.expire_claims(later), 1);
        assert_eq!(q.active_claim_count(), 0);

        let again = q.claim()?;
        assert_eq!(again.key, "B");
        assert_eq!(again.messages, vec!["x"]);
        assert_eq!(q.acknowledge(&"B", pack.token), Release::Stale);
        Ok(())
    }

    #[test]
    fn expiry_pass_requeues_keys_in_claim_order() -> Result<(), Box<dyn Error>> {
        let q: KeyQueue<String, u32> = KeyQueue::new(QueueConfig::default());
        let keys: Vec<String> = (0..32).map(|n| format!("k{:02}", n)).collect();
        for key in keys.iter() {
            q.push(key.clone(), 1);
        }
        for key in keys.iter() {
            assert_eq!(&q.claim()?.key, key);
        }

        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(q.expire_claims(later), keys.len());

        let mut reclaimed = Vec::with_capacity(keys.len());
        for _ in 0..keys.len() {
            reclaimed.push(q.claim()?.key);
        }
        assert_eq!(reclaimed, keys);
        Ok(())
    }

    #[test]
    fn expiry_keeps_messages_pushed_during_claim() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "m1");
        let _abandoned = q.claim()?;
        q.push("A", "m2");

        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(q.expire_claims(later), 1);
        assert_eq!(q.stored_message_count(), 2);

        let again = q.claim()?;
        assert_eq!(again.messages, vec!["m1", "m2"]);
        assert_eq!(q.stored_message_count(), 2);
        Ok(())
    }

    #[test]
    fn stats_tracks_every_counter() -> Result<(), Box<dyn Error>> {
        let q = queue();
        q.push("A", "m1");
        q.push("A", "m2");
        q.push("B", "m3");
        let _ = q.claim()?;

        assert_eq!(
            q.stats(),
            QueueStats {
                keys: 2,
                queued_keys: 1,
                active_claims: 1,
                stored_messages: 3,
            }
        );
        Ok(())
    }

    #[test]
    fn with_reaper_rejects_invalid_config() {
        let cfg = QueueConfig {
            lease_window_ms: 0,
            reap_interval_ms: None,
        };
        let result = KeyQueue::<String, Vec<u8>>::with_reaper(cfg);
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn with_reaper_expires_abandoned_claim() -> Result<(), Box<dyn Error>> {
        let cfg = QueueConfig::builder()
            .lease_window(Duration::from_millis(50))
            .reap_interval(Duration::from_millis(10))
            .build()?;
        let (q, reaper) = KeyQueue::<String, String>::with_reaper(cfg)?;
        q.push("B".to_string(), "x".to_string());
        let _abandoned = q.claim()?;

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(q.active_claim_count(), 0);
        assert_eq!(q.claim()?.messages, vec!["x".to_string()]);
        reaper.shutdown();
        Ok(())
    }
}
