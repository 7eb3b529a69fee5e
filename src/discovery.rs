//! First-discovery arbitration and arrival ordering between related
//! submissions.

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::PipelineError;

/// Credit for the first discoverer.
pub const FULL_CREDIT: f64 = 1.0;
/// Credit for another miner inside the grace window.
pub const SHARED_CREDIT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Pending,
    /// Permanent once entered.
    Resolved,
}

#[derive(Debug, Clone)]
pub struct DiscoveryRecord {
    pub first_discoverer: String,
    pub first_sequence: u64,
    pub first_arrived_at: DateTime<Utc>,
    pub state: DiscoveryState,
    /// Miners already credited for this pattern.
    credited: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credit {
    /// First sighting.
    First,
    /// Different miner, inside the grace window.
    Partial,
    /// Different miner, after the grace window.
    Late,
    /// The same miner (or an already credited one) again.
    Resubmission,
}

impl Credit {
    pub fn multiplier(&self) -> f64 {
        match self {
            Credit::First => FULL_CREDIT,
            Credit::Partial => SHARED_CREDIT,
            Credit::Late | Credit::Resubmission => 0.0,
        }
    }
}

/// `unseen -> pending -> resolved` per indexed pattern id.
pub struct DiscoveryRegistry {
    records: DashMap<String, DiscoveryRecord>,
    grace: Duration,
}

impl DiscoveryRegistry {
    pub fn new(grace_period_secs: i64) -> Self {
        Self {
            records: DashMap::new(),
            grace: Duration::seconds(grace_period_secs),
        }
    }

    /// Records the first discoverer of a newly indexed pattern.
    pub fn register_first(&self, pattern_id: &str, miner: &str, sequence: u64, arrived_at: DateTime<Utc>) -> Credit {
        let mut credited = HashSet::new();
        credited.insert(miner.to_string());
        self.records.insert(
            pattern_id.to_string(),
            DiscoveryRecord {
                first_discoverer: miner.to_string(),
                first_sequence: sequence,
                first_arrived_at: arrived_at,
                state: DiscoveryState::Pending,
                credited,
            },
        );
        Credit::First
    }

    /// Decides credit for a submission matching `pattern_id`. Ordering uses
    /// the validator's arrival time only.
    pub fn arbitrate(
        &self,
        pattern_id: &str,
        miner: &str,
        sequence: u64,
        arrived_at: DateTime<Utc>,
    ) -> Result<Credit, PipelineError> {
        let mut record = self
            .records
            .get_mut(pattern_id)
            .ok_or_else(|| PipelineError::MissingDiscoveryRecord {
                pattern_id: pattern_id.to_string(),
            })?;

        if sequence < record.first_sequence {
            return Err(PipelineError::Invariant(format!(
                "arrival {sequence} adjudicated after later discoverer {}",
                record.first_sequence
            )));
        }

        if record.state == DiscoveryState::Pending && arrived_at - record.first_arrived_at > self.grace {
            record.state = DiscoveryState::Resolved;
            debug!(pattern_id, discoverer = %record.first_discoverer, "Discovery window closed");
        }

        if record.credited.contains(miner) {
            return Ok(Credit::Resubmission);
        }

        match record.state {
            DiscoveryState::Pending => {
                record.credited.insert(miner.to_string());
                Ok(Credit::Partial)
            }
            DiscoveryState::Resolved => Ok(Credit::Late),
        }
    }

    pub fn state(&self, pattern_id: &str) -> Option<DiscoveryState> {
        self.records.get(pattern_id).map(|r| r.state)
    }

    /// Forgets records whose first sighting is older than `retention`.
    pub fn prune(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.records.len();
        let grace = self.grace;
        self.records.retain(|_, r| {
            if r.state == DiscoveryState::Pending && now - r.first_arrived_at > grace {
                r.state = DiscoveryState::Resolved;
            }
            now - r.first_arrived_at <= retention
        });
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reservations still held on one key, by sequence.
struct Lane<T> {
    pending: Mutex<BTreeMap<u64, T>>,
    notify: Notify,
}

impl<T> Default for Lane<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
        }
    }
}

/// Orders critical sections between related items in arrival-sequence
/// order.
///
/// Sequences are reserved synchronously at admission. A reservation waits
/// only for earlier reservations on the same key whose item is related to
/// its own, so a slow item holds back just the arrivals it could collide
/// with.
pub struct Sequencer<K: Eq + Hash + Clone, T> {
    lanes: Arc<DashMap<K, Arc<Lane<T>>>>,
}

impl<K: Eq + Hash + Clone, T> Clone for Sequencer<K, T> {
    fn clone(&self) -> Self {
        Self {
            lanes: Arc::clone(&self.lanes),
        }
    }
}

impl<K: Eq + Hash + Clone, T> Default for Sequencer<K, T> {
    fn default() -> Self {
        Self {
            lanes: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, T> Sequencer<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called in increasing `sequence` order per key. `related`
    /// is asked about every earlier reservation still pending.
    pub fn reserve(&self, key: K, sequence: u64, item: T, related: impl Fn(&T, &T) -> bool) -> Ticket<K, T> {
        // Insert under the map entry so a concurrent release cannot retire
        // the lane in between.
        let entry = self.lanes.entry(key.clone()).or_default();
        let lane = Arc::clone(entry.value());
        let waits_on = {
            let mut pending = lock(&lane.pending);
            let waits_on = pending
                .range(..sequence)
                .filter(|&(_, other)| related(other, &item))
                .map(|(&seq, _)| seq)
                .collect();
            pending.insert(sequence, item);
            waits_on
        };
        drop(entry);
        Ticket {
            key,
            sequence,
            waits_on,
            lane,
            lanes: Arc::clone(&self.lanes),
        }
    }

    #[cfg(test)]
    fn active_lanes(&self) -> usize {
        self.lanes.len()
    }
}

/// A reserved place in the arrival order. Dropping it releases the place,
/// including on early exit or panic.
pub struct Ticket<K: Eq + Hash + Clone, T> {
    key: K,
    sequence: u64,
    waits_on: Vec<u64>,
    lane: Arc<Lane<T>>,
    lanes: Arc<DashMap<K, Arc<Lane<T>>>>,
}

impl<K: Eq + Hash + Clone, T> Ticket<K, T> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Earlier related reservations this ticket waits for.
    pub fn waits_on(&self) -> &[u64] {
        &self.waits_on
    }

    /// Resolves once every earlier related reservation is released.
    pub async fn wait_turn(&self) -> Result<(), PipelineError> {
        loop {
            let notified = self.lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let pending = lock(&self.lane.pending);
                if !pending.contains_key(&self.sequence) {
                    return Err(PipelineError::TicketReleased {
                        sequence: self.sequence,
                    });
                }
                if !self.waits_on.iter().any(|seq| pending.contains_key(seq)) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

impl<K: Eq + Hash + Clone, T> Drop for Ticket<K, T> {
    fn drop(&mut self) {
        let emptied = {
            let mut pending = lock(&self.lane.pending);
            pending.remove(&self.sequence);
            pending.is_empty()
        };
        self.lane.notify.notify_waiters();
        if emptied {
            self.lanes.remove_if(&self.key, |_, lane| {
                Arc::ptr_eq(lane, &self.lane) && lock(&lane.pending).is_empty()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn grace_window_credit() {
        let registry = DiscoveryRegistry::new(300);
        assert_eq!(registry.register_first("p", "A", 1, at(0)).multiplier(), 1.0);
        assert_eq!(registry.arbitrate("p", "B", 2, at(200)).unwrap(), Credit::Partial);
        assert_eq!(registry.state("p"), Some(DiscoveryState::Pending));
        assert_eq!(registry.arbitrate("p", "C", 3, at(400)).unwrap(), Credit::Late);
        assert_eq!(registry.state("p"), Some(DiscoveryState::Resolved));
    }

    #[test]
    fn resolution_is_permanent() {
        let registry = DiscoveryRegistry::new(300);
        registry.register_first("p", "A", 1, at(0));
        assert_eq!(registry.arbitrate("p", "C", 5, at(301)).unwrap(), Credit::Late);
        // An out-of-order timestamp inside the window does not reopen it.
        assert_eq!(registry.arbitrate("p", "D", 6, at(100)).unwrap(), Credit::Late);
    }

    #[test]
    fn repeat_miners_get_nothing_more() {
        let registry = DiscoveryRegistry::new(300);
        registry.register_first("p", "A", 1, at(0));
        assert_eq!(registry.arbitrate("p", "A", 2, at(10)).unwrap(), Credit::Resubmission);
        assert_eq!(registry.arbitrate("p", "B", 3, at(20)).unwrap(), Credit::Partial);
        assert_eq!(registry.arbitrate("p", "B", 4, at(30)).unwrap(), Credit::Resubmission);
    }

    #[test]
    fn missing_record_is_internal_error() {
        let registry = DiscoveryRegistry::new(300);
        assert!(matches!(
            registry.arbitrate("nope", "A", 1, at(0)),
            Err(PipelineError::MissingDiscoveryRecord { .. })
        ));
    }

    #[test]
    fn prune_drops_old_records() {
        let registry = DiscoveryRegistry::new(300);
        registry.register_first("old", "A", 1, at(0));
        registry.register_first("new", "A", 2, at(90_000));
        assert_eq!(registry.prune(at(90_100), Duration::hours(24)), 1);
        assert_eq!(registry.state("new"), Some(DiscoveryState::Pending));
    }

    fn same_parity(a: &u32, b: &u32) -> bool {
        a % 2 == b % 2
    }

    #[tokio::test]
    async fn related_tickets_admitted_in_sequence_order() {
        let sequencer: Sequencer<&'static str, u32> = Sequencer::new();
        let first = sequencer.reserve("k", 1, 2, same_parity);
        let second = sequencer.reserve("k", 2, 4, same_parity);
        let other = sequencer.reserve("other", 3, 6, same_parity);
        assert_eq!(second.waits_on(), &[1]);

        // Another key is not blocked.
        other.wait_turn().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        let waiter = tokio::spawn(async move {
            second.wait_turn().await.unwrap();
            log.lock().unwrap().push(2);
        });

        tokio::task::yield_now().await;
        first.wait_turn().await.unwrap();
        order.lock().unwrap().push(1);
        drop(first);

        waiter.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        drop(other);
        assert_eq!(sequencer.active_lanes(), 0);
    }

    #[tokio::test]
    async fn unrelated_ticket_passes_a_held_one() {
        let sequencer: Sequencer<&'static str, u32> = Sequencer::new();
        let held = sequencer.reserve("k", 1, 1, same_parity);
        let unrelated = sequencer.reserve("k", 2, 2, same_parity);
        let related = sequencer.reserve("k", 3, 3, same_parity);
        assert!(unrelated.waits_on().is_empty());
        assert_eq!(related.waits_on(), &[1]);

        unrelated.wait_turn().await.unwrap();
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), related.wait_turn()).await;
        assert!(blocked.is_err());

        drop(held);
        related.wait_turn().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_ticket_unblocks_successor() {
        let sequencer: Sequencer<u8, ()> = Sequencer::new();
        let first = sequencer.reserve(0, 10, (), |_, _| true);
        let second = sequencer.reserve(0, 11, (), |_, _| true);
        drop(first);
        second.wait_turn().await.unwrap();
    }
}
