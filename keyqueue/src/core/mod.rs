use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};

/// Identifies one claim instance. Minted from a per-queue counter, never
/// from the clock, so two claims taken in the same tick stay distinct.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimToken(u64);

impl ClaimToken {
    pub fn from_raw(value: u64) -> ClaimToken {
        ClaimToken(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a claim ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClaimEnd {
    /// The consumer processed the snapshot; its prefix is drained.
    Acknowledged,
    /// The lease ran out; every message stays queued.
    Expired,
}

/// Outcome of ending a claim.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Release {
    /// The buffer is empty and the key was removed.
    Drained,
    /// Messages remain and the key went back to the tail of the order queue.
    Requeued,
    /// Unknown key, unclaimed key, or a token from an earlier claim. Nothing changed.
    Stale,
}

#[derive(Copy, Clone, Debug)]
struct Claim {
    token: ClaimToken,
    claimed_at: Instant,
}

#[derive(Debug)]
pub struct MessagePack<M> {
    messages: VecDeque<M>,
    // Prefix length visible when the current claim was taken.
    claimed_count: usize,
    claim: Option<Claim>,
}

impl<M> MessagePack<M> {
    fn new(message: M) -> MessagePack<M> {
        let mut messages = VecDeque::with_capacity(1);
        messages.push_back(message);
        MessagePack {
            messages,
            claimed_count: 0,
            claim: None,
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &M> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed_count
    }

    pub fn token(&self) -> Option<ClaimToken> {
        self.claim.map(|c| c.token)
    }

    pub fn is_claimed(&self) -> bool {
        self.claim.is_some()
    }
}

/// What a consumer receives from a claim: a copy of the key's buffer as it
/// was at claim time. Later pushes are not reflected here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedPack<K, M> {
    pub key: K,
    pub messages: Vec<M>,
    pub token: ClaimToken,
}

impl<K, M> ClaimedPack<K, M> {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Key ledger plus arrival order queue. Not synchronized; `KeyQueue` owns it
/// behind a single mutex.
///
/// Invariants kept by every method:
/// - a key is in `packs` iff its buffer is non-empty,
/// - a key is in `order` iff it is in `packs` and unclaimed,
/// - a key is in `claimed` iff its pack holds a claim.
#[derive(Debug)]
pub struct Ledger<K, M> {
    packs: HashMap<K, MessagePack<M>>,
    order: VecDeque<K>,
    claimed: HashSet<K>,
    last_token: u64,
    stored_messages: usize,
}

impl<K, M> Default for Ledger<K, M> {
    fn default() -> Self {
        Ledger {
            packs: HashMap::new(),
            order: VecDeque::new(),
            claimed: HashSet::new(),
            last_token: 0,
            stored_messages: 0,
        }
    }
}

impl<K, M> Ledger<K, M>
where
    K: Eq + Hash + Clone,
    M: Clone,
{
    pub fn new() -> Ledger<K, M> {
        Ledger::default()
    }

    pub fn push(&mut self, key: K, message: M) {
        match self.packs.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().messages.push_back(message),
            Entry::Vacant(entry) => {
                self.order.push_back(entry.key().clone());
                entry.insert(MessagePack::new(message));
            }
        }
        self.stored_messages += 1;
    }

    /// Pops the oldest unclaimed key and claims every message it holds right now.
    pub fn claim(&mut self, now: Instant) -> Option<ClaimedPack<K, M>> {
        while let Some(key) = self.order.pop_front() {
            let pack = match self.packs.get_mut(&key) {
                Some(pack) => pack,
                None => continue,
            };
            debug_assert!(pack.claim.is_none(), "queued key must be unclaimed");
            debug_assert!(!pack.messages.is_empty(), "queued key must hold messages");

            self.last_token += 1;
            let token = ClaimToken(self.last_token);
            pack.claimed_count = pack.messages.len();
            pack.claim = Some(Claim {
                token,
                claimed_at: now,
            });
            self.claimed.insert(key.clone());
            return Some(ClaimedPack {
                messages: pack.messages.iter().cloned().collect(),
                key,
                token,
            });
        }
        None
    }

    /// The one transition out of CLAIMED, shared by acknowledgment and expiry.
    /// The token comparison and the clear happen in this single call.
    pub fn release(&mut self, key: &K, token: ClaimToken, end: ClaimEnd) -> Release {
        let pack = match self.packs.get_mut(key) {
            Some(pack) => pack,
            None => return Release::Stale,
        };
        match pack.claim {
            Some(claim) if claim.token == token => {}
            _ => return Release::Stale,
        }

        let consumed = match end {
            ClaimEnd::Acknowledged => pack.claimed_count,
            ClaimEnd::Expired => 0,
        };
        pack.messages.drain(..consumed);
        pack.claimed_count = 0;
        pack.claim = None;
        self.claimed.remove(key);
        self.stored_messages -= consumed;

        if pack.messages.is_empty() {
            self.packs.remove(key);
            Release::Drained
        } else {
            self.order.push_back(key.clone());
            Release::Requeued
        }
    }

    /// Claims held for at least `lease_window` as of `now`, oldest claim first.
    pub fn overdue(&self, now: Instant, lease_window: Duration) -> Vec<(K, ClaimToken)> {
        let mut overdue: Vec<(K, ClaimToken)> = self
            .claimed
            .iter()
            .filter_map(|key| {
                let claim = self.packs.get(key)?.claim?;
                if now.saturating_duration_since(claim.claimed_at) >= lease_window {
                    Some((key.clone(), claim.token))
                } else {
                    None
                }
            })
            .collect();
        // Tokens are minted in claim order; requeue expired keys the same way.
        overdue.sort_unstable_by_key(|(_, token)| *token);
        overdue
    }

    pub fn pack(&self, key: &K) -> Option<&MessagePack<M>> {
        self.packs.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.packs.contains_key(key)
    }

    pub fn is_queued(&self, key: &K) -> bool {
        self.order.contains(key)
    }

    pub fn queued_keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    pub fn key_count(&self) -> usize {
        self.packs.len()
    }

    pub fn queued_key_count(&self) -> usize {
        self.order.len()
    }

    pub fn active_claims(&self) -> usize {
        self.claimed.len()
    }

    pub fn stored_messages(&self) -> usize {
        self.stored_messages
    }
}
