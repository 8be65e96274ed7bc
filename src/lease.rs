// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lease-based liveliness (spec §3.8, §4.2 "Liveliness propagation", §8
//! scenario 6).
//!
//! A real Fibonacci heap buys O(1) amortized "decrease key" (lease
//! renewal) at the cost of a much more involved implementation; this
//! crate uses a `BinaryHeap`-backed min-heap instead; the DESIGN.md ledger
//! records the trade-off. The externally visible contract — an
//! atomically-swappable "current minimum" the background lease thread
//! polls without touching the heap on every tick (Design Notes §9) — is
//! preserved via [`LeaseHeap::representative`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::guid::Guid;

/// One lease record: an entity's promise to renew before `expiry`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub entity: Guid,
    pub expiry: Instant,
    pub duration: Duration,
}

impl Lease {
    pub fn new(entity: Guid, duration: Duration) -> Self {
        Self {
            entity,
            expiry: Instant::now() + duration,
            duration,
        }
    }

    pub fn renewed(&self) -> Self {
        Self {
            entity: self.entity,
            expiry: Instant::now() + self.duration,
            duration: self.duration,
        }
    }
}

impl PartialEq for Lease {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry
    }
}
impl Eq for Lease {}
impl PartialOrd for Lease {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Lease {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expiry.cmp(&other.expiry)
    }
}

/// A heap of leases keyed by expiry, one per liveliness kind per
/// participant (spec §3.8: "Two lease heaps are maintained per
/// participant: one for AUTOMATIC liveliness, one for
/// MANUAL-BY-PARTICIPANT").
pub struct LeaseHeap {
    heap: Mutex<BinaryHeap<Reverse<Lease>>>,
    representative: ArcSwapOption<Lease>,
    generation: AtomicU64,
}

impl Default for LeaseHeap {
    fn default() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            representative: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
        }
    }
}

impl LeaseHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<Lease>>> {
        match self.heap.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::debug!("lease heap mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Insert or renew a lease, then republish the representative minimum
    /// if this entry is now the soonest-expiring one.
    pub fn push(&self, lease: Lease) {
        let mut heap = self.lock();
        heap.push(Reverse(lease));
        self.refresh_representative(&heap);
    }

    /// Pop the minimum if it has already expired as of `now`; otherwise
    /// leave the heap untouched. Called by the lease thread once the
    /// representative's expiry is reached.
    pub fn pop_expired(&self, now: Instant) -> Option<Lease> {
        let mut heap = self.lock();
        match heap.peek() {
            Some(Reverse(lease)) if lease.expiry <= now => {
                let Reverse(lease) = heap.pop().expect("peeked non-empty heap");
                self.refresh_representative(&heap);
                Some(lease)
            }
            _ => None,
        }
    }

    fn refresh_representative(&self, heap: &BinaryHeap<Reverse<Lease>>) {
        let min = heap.peek().map(|Reverse(l)| Arc::new(l.clone()));
        self.representative.store(min);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// The current minimum, published without touching the heap (Design
    /// Notes §9 "Fibonacci-heap leases"). The lease thread polls this.
    pub fn representative(&self) -> Option<Arc<Lease>> {
        self.representative.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u8) -> Guid {
        Guid::new([n; 12], [0, 0, 0, 2])
    }

    #[test]
    fn representative_tracks_soonest_expiry() {
        let heap = LeaseHeap::new();
        heap.push(Lease::new(guid(1), Duration::from_secs(10)));
        heap.push(Lease::new(guid(2), Duration::from_millis(1)));
        let rep = heap.representative().unwrap();
        assert_eq!(rep.entity, guid(2));
    }

    #[test]
    fn pop_expired_only_returns_past_deadline() {
        let heap = LeaseHeap::new();
        heap.push(Lease::new(guid(1), Duration::from_secs(10)));
        assert!(heap.pop_expired(Instant::now()).is_none());
        assert!(heap.pop_expired(Instant::now() + Duration::from_secs(11)).is_some());
    }
}
