// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Proxy writer: the local mirror of a remote `DataWriter` (spec §3.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::entity::Vclock;
use crate::guid::Guid;
use crate::lease::Lease;
use crate::proxy::defrag::DefragBuffer;
use crate::proxy::reorder::ReorderBuffer;

/// Per-matched-local-reader state a proxy writer tracks (spec §3.5: "a map
/// from matched local reader to per-match state (in-sync flag, acknack
/// cadence event, and a secondary reorder buffer used only while that
/// reader is catching up on transient-local history)").
pub struct ProxyWriterReaderMatch {
    pub reader: Guid,
    /// Whether this reader has finished consuming transient-local history
    /// and is now receiving live samples through the primary reorder buffer.
    pub in_sync: bool,
    /// Next scheduled acknack send time, nanoseconds since an arbitrary
    /// epoch (spec §3.5 "acknack cadence event"); `None` until the first
    /// HEARTBEAT is processed.
    pub next_acknack_nanos: Option<u64>,
    /// Used only while `in_sync == false`, to replay transient-local
    /// history independently of the live stream (spec §3.5).
    pub secondary_reorder: Option<ReorderBuffer>,
}

impl ProxyWriterReaderMatch {
    pub fn new(reader: Guid) -> Self {
        Self {
            reader,
            in_sync: false,
            next_acknack_nanos: None,
            secondary_reorder: None,
        }
    }

    pub fn begin_catchup(&mut self, max_samples: usize) {
        self.in_sync = false;
        self.secondary_reorder = Some(ReorderBuffer::new(max_samples));
    }

    /// Transient-local catch-up complete; fold back onto the primary
    /// reorder buffer's stream.
    pub fn mark_in_sync(&mut self) {
        self.in_sync = true;
        self.secondary_reorder = None;
    }
}

/// The local mirror of a remote writer (spec §3.5): "owns a
/// defragmentation buffer, a primary reorder buffer, a map from matched
/// local reader to per-match state, an alive flag with a version counter,
/// and a lease if liveliness is not AUTOMATIC-by-participant."
pub struct ProxyWriter {
    pub guid: Guid,
    defrag: std::sync::Mutex<DefragBuffer>,
    reorder: std::sync::Mutex<ReorderBuffer>,
    matches: RwLock<HashMap<Guid, ProxyWriterReaderMatch>>,
    alive: AtomicBool,
    alive_vclock: Vclock,
    lease: RwLock<Option<Lease>>,
    heartbeat_count_seen: AtomicU64,
}

impl ProxyWriter {
    pub fn new(guid: Guid, defrag_max_samples: usize, reorder_max_samples: usize) -> Self {
        Self {
            guid,
            defrag: std::sync::Mutex::new(DefragBuffer::new(defrag_max_samples)),
            reorder: std::sync::Mutex::new(ReorderBuffer::new(reorder_max_samples)),
            matches: RwLock::new(HashMap::new()),
            alive: AtomicBool::new(true),
            alive_vclock: Vclock::new(),
            lease: RwLock::new(None),
            heartbeat_count_seen: AtomicU64::new(0),
        }
    }

    fn lock_defrag(&self) -> std::sync::MutexGuard<'_, DefragBuffer> {
        match self.defrag.lock() {
            Ok(g) => g,
            Err(p) => {
                log::debug!("proxy writer defrag mutex poisoned, recovering");
                p.into_inner()
            }
        }
    }

    fn lock_reorder(&self) -> std::sync::MutexGuard<'_, ReorderBuffer> {
        match self.reorder.lock() {
            Ok(g) => g,
            Err(p) => {
                log::debug!("proxy writer reorder mutex poisoned, recovering");
                p.into_inner()
            }
        }
    }

    /// Feed one DATA_FRAG fragment; returns reassembled-and-in-order
    /// samples ready for RHC delivery.
    pub fn receive_fragment(
        &self,
        seq: u64,
        fragment_index: u32,
        fragment_size: usize,
        total_size: usize,
        bytes: Vec<u8>,
    ) -> Vec<(u64, Vec<u8>)> {
        let assembled = self
            .lock_defrag()
            .receive_fragment(seq, fragment_index, fragment_size, total_size, bytes);
        match assembled {
            Some(payload) => self.lock_reorder().receive(seq, payload),
            None => Vec::new(),
        }
    }

    /// Feed one complete (unfragmented) DATA sample.
    pub fn receive_sample(&self, seq: u64, payload: Vec<u8>) -> Vec<(u64, Vec<u8>)> {
        self.lock_reorder().receive(seq, payload)
    }

    /// A GAP submessage announcing sequence numbers that will never arrive
    /// (spec §6.1 GAP row): advance the reorder cursor accordingly.
    pub fn receive_gap(&self, up_to_exclusive: u64) {
        if up_to_exclusive == 0 {
            return;
        }
        self.lock_reorder().set_last_delivered_seq(up_to_exclusive - 1);
    }

    pub fn last_delivered_seq(&self) -> u64 {
        self.lock_reorder().last_delivered_seq()
    }

    /// What this proxy writer still needs from `writer` to catch up to
    /// `upper_bound_exclusive`, for building an ACKNACK in response to a
    /// HEARTBEAT (spec §6.1 ACKNACK row).
    pub fn missing_below(&self, upper_bound_exclusive: u64) -> Vec<u64> {
        self.lock_reorder().missing_in_range(upper_bound_exclusive)
    }

    pub fn insert_reader_match(&self, reader: Guid) {
        let mut matches = self.matches.write().expect("proxy writer match lock");
        matches.insert(reader, ProxyWriterReaderMatch::new(reader));
    }

    pub fn remove_reader_match(&self, reader: &Guid) {
        self.matches.write().expect("proxy writer match lock").remove(reader);
    }

    pub fn with_reader_match<R>(&self, reader: &Guid, f: impl FnOnce(&mut ProxyWriterReaderMatch) -> R) -> Option<R> {
        let mut matches = self.matches.write().expect("proxy writer match lock");
        matches.get_mut(reader).map(f)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn alive_vclock(&self) -> u64 {
        self.alive_vclock.load()
    }

    /// Flip alive state, advancing the vclock so matched readers observe
    /// liveliness transitions in publication order (spec §4.2 "Liveliness
    /// propagation", §8 scenario 6).
    pub fn set_alive(&self, alive: bool) -> u64 {
        self.alive.store(alive, Ordering::Release);
        self.alive_vclock.advance()
    }

    pub fn set_lease(&self, lease: Option<Lease>) {
        *self.lease.write().expect("proxy writer lease lock") = lease;
    }

    pub fn renew_lease(&self) {
        let mut guard = self.lease.write().expect("proxy writer lease lock");
        if let Some(lease) = guard.as_ref() {
            *guard = Some(lease.renewed());
        }
    }

    pub fn note_heartbeat(&self, count: u32) -> bool {
        let count = count as u64;
        let prev = self.heartbeat_count_seen.fetch_max(count, Ordering::AcqRel);
        count > prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u8) -> Guid {
        Guid::new([n; 12], [0, 0, 0, 0xc2])
    }

    #[test]
    fn fragmented_sample_delivers_once_reassembled() {
        let pw = ProxyWriter::new(guid(1), 16, 16);
        assert!(pw.receive_fragment(1, 0, 4, 8, vec![1, 2, 3, 4]).is_empty());
        let ready = pw.receive_fragment(1, 1, 4, 8, vec![5, 6, 7, 8]);
        assert_eq!(ready, vec![(1, vec![1, 2, 3, 4, 5, 6, 7, 8])]);
    }

    #[test]
    fn gap_advances_delivery_cursor() {
        let pw = ProxyWriter::new(guid(1), 16, 16);
        pw.receive_sample(5, vec![5]);
        pw.receive_gap(5);
        assert_eq!(pw.last_delivered_seq(), 4);
    }

    #[test]
    fn liveliness_flip_advances_vclock_monotonically() {
        let pw = ProxyWriter::new(guid(1), 16, 16);
        let v1 = pw.set_alive(false);
        let v2 = pw.set_alive(true);
        assert!(v2 > v1);
        assert!(pw.is_alive());
    }

    #[test]
    fn heartbeat_count_only_advances_forward() {
        let pw = ProxyWriter::new(guid(1), 16, 16);
        assert!(pw.note_heartbeat(5));
        assert!(!pw.note_heartbeat(5));
        assert!(pw.note_heartbeat(6));
    }
}
