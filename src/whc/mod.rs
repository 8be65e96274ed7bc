// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Writer History Cache (spec §3.6, §4.1) — the hardest data structure in
//! the core: a per-writer store of published samples cross-indexed by
//! sequence number (for retransmission) and by instance (for keep-last
//! semantics on transient-local data).

pub mod intervals;
pub mod node;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use intervals::IntervalTree;
use node::{IdxNode, Node, Payload, StatusInfo};

use crate::error::{Error, Result};
use crate::instance::InstanceHandle;
use crate::rt::slabpool::SlabPool;

/// `{min_seq, max_seq, unacked_bytes}` snapshot (spec §4.1 `get_state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhcState {
    pub min_seq: Option<u64>,
    pub max_seq: Option<u64>,
    pub unacked_bytes: usize,
}

/// Process-wide bounded freelist of retired [`Node`]s (spec §4.1
/// `free_deferred_free_list`: "pushed to a process-wide bounded freelist;
/// the overflow is returned to the allocator").
pub struct NodeFreeList {
    cap: usize,
    nodes: std::sync::Mutex<Vec<Node>>,
}

impl NodeFreeList {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            cap,
            nodes: std::sync::Mutex::new(Vec::with_capacity(cap.min(256))),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Node>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::debug!("whc freelist mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Push a retired node; dropped (returned to the allocator) if the
    /// freelist is already at capacity.
    pub fn push(&self, node: Node) {
        let mut guard = self.lock();
        if guard.len() < self.cap {
            guard.push(node);
        }
    }

    /// Pop a node for reuse, if any is available; the caller overwrites
    /// every field before reuse.
    pub fn pop(&self) -> Option<Node> {
        self.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

struct Inner {
    intervals: IntervalTree,
    seq_hash: HashMap<u64, Node>,
    idx: HashMap<InstanceHandle, IdxNode>,
    max_drop_seq: u64,
    total_bytes: usize,
    unacked_bytes: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            intervals: IntervalTree::new(),
            seq_hash: HashMap::new(),
            idx: HashMap::new(),
            max_drop_seq: 0,
            total_bytes: 0,
            unacked_bytes: 0,
        }
    }

    /// Unlink a node from the sequence administration entirely, returning
    /// it for the deferred-free list.
    fn unlink(&mut self, seq: u64) -> Option<Node> {
        self.intervals.remove(seq);
        let node = self.seq_hash.remove(&seq)?;
        self.total_bytes = self.total_bytes.saturating_sub(node.size);
        if node.unacked {
            self.unacked_bytes = self.unacked_bytes.saturating_sub(node.size);
        }
        Some(node)
    }
}

/// Per-writer history cache (spec §3.6, §4.1).
pub struct WriterHistoryCache {
    /// `idxdepth = max(history_depth, transient_local_history_depth)`.
    idxdepth: usize,
    /// `tldepth`: 0 unless durability is TRANSIENT_LOCAL.
    tldepth: usize,
    is_transient_local: bool,
    has_deadline: bool,
    slabpool: Arc<SlabPool>,
    freelist: Arc<NodeFreeList>,
    inner: std::sync::Mutex<Inner>,
}

impl WriterHistoryCache {
    pub fn new(
        idxdepth: usize,
        tldepth: usize,
        is_transient_local: bool,
        has_deadline: bool,
        slabpool: Arc<SlabPool>,
        freelist: Arc<NodeFreeList>,
    ) -> Self {
        Self {
            idxdepth,
            tldepth,
            is_transient_local,
            has_deadline,
            slabpool,
            freelist,
            inner: std::sync::Mutex::new(Inner::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::debug!("whc mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// No-index fast path is permitted iff `idxdepth == 0 && !has_deadline
    /// && !is_transient_local` (spec §4.1 `remove_acked_messages`).
    fn fast_path_eligible(&self) -> bool {
        self.idxdepth == 0 && !self.has_deadline && !self.is_transient_local
    }

    fn alloc_payload(&self, bytes: &[u8]) -> Result<Payload> {
        if bytes.is_empty() {
            return Ok(Payload::Heap(Arc::from(&[][..])));
        }
        if let Some((handle, slot)) = self.slabpool.reserve(bytes.len()) {
            slot[..bytes.len()].copy_from_slice(bytes);
            self.slabpool.commit(handle, bytes.len());
            Ok(Payload::Slab {
                handle,
                len: bytes.len(),
            })
        } else {
            Ok(Payload::Heap(Arc::from(bytes)))
        }
    }

    fn release_payload(&self, payload: &Payload) {
        if let Payload::Slab { handle, .. } = payload {
            self.slabpool.release(*handle);
        }
    }

    /// Materialize a payload's bytes, reading through the slab pool for
    /// slab-backed samples. Used by the retransmit path, which needs an
    /// owned byte range to split into fragments.
    pub fn payload_bytes(&self, payload: &Payload) -> Vec<u8> {
        match payload {
            Payload::Slab { handle, len } => self.slabpool.get_buffer(*handle)[..*len].to_vec(),
            Payload::Heap(bytes) => bytes.to_vec(),
        }
    }

    /// Insert a published sample (spec §4.1 "Sample insertion").
    ///
    /// Preconditions (caller contract, not runtime-checked in release
    /// builds per spec §4.1 "Failure semantics"): `seq` greater than any
    /// previously inserted sequence number, and `max_drop_seq` no smaller
    /// than the previous call's.
    pub fn insert(
        &self,
        max_drop_seq: u64,
        seq: u64,
        tk: InstanceHandle,
        status_info: StatusInfo,
        payload_bytes: &[u8],
    ) -> Result<()> {
        let payload = self.alloc_payload(payload_bytes)?;
        let mut inner = self.lock();

        debug_assert!(
            inner.intervals.max_seq().map_or(true, |m| seq > m),
            "WHC insert requires strictly increasing sequence numbers"
        );
        debug_assert!(
            max_drop_seq >= inner.max_drop_seq,
            "WHC insert requires non-decreasing max_drop_seq"
        );

        let unacked = seq > max_drop_seq;
        let mut node = self.freelist.pop().unwrap_or_else(|| Node::new(seq, payload.clone(), status_info, unacked));
        node.seq = seq;
        node.size = payload.len();
        node.last_retransmit = None;
        node.retransmit_count = 0;
        node.unacked = unacked;
        node.borrowed = false;
        node.instance = Some(tk);
        node.status_info = status_info;
        node.payload = payload;
        node.instance_slot = None;

        inner.intervals.extend_open(seq);
        inner.total_bytes += node.size;
        if unacked {
            inner.unacked_bytes += node.size;
        }
        inner.max_drop_seq = inner.max_drop_seq.max(max_drop_seq);

        if status_info.is_empty_sample() {
            // Unregister: always remove the whole instance index entry
            // (no-op if the instance was never indexed), then drop this
            // node too if it is already acked.
            inner.idx.remove(&tk);
            inner.seq_hash.insert(seq, node);
            if seq <= max_drop_seq {
                if let Some(freed) = inner.unlink(seq) {
                    self.release_payload(&freed.payload);
                    self.freelist.push(freed);
                }
            }
            return Ok(());
        }

        if self.idxdepth > 0 {
            // idxdepth == 0 means KEEP_ALL with no per-instance retention
            // window (spec §4.1 no-index fast path precondition); every
            // sample just stays in the sequence administration instead.
            if let Some(idx) = inner.idx.get_mut(&tk) {
                if let Some(evicted_seq) = idx.advance_and_take(seq) {
                    if evicted_seq <= inner.max_drop_seq {
                        if let Some(freed) = inner.unlink(evicted_seq) {
                            self.release_payload(&freed.payload);
                            self.freelist.push(freed);
                        }
                    }
                }
                node.instance_slot = Some(idx.headidx);
            } else {
                let mut idxnode = IdxNode::new(self.idxdepth);
                idxnode.hist[0] = Some(seq);
                node.instance_slot = Some(0);
                inner.idx.insert(tk, idxnode);
            }

            if !unacked && self.tldepth < self.idxdepth {
                self.prune_transient_local_boundary(&mut inner, tk);
            }
        }

        inner.seq_hash.insert(seq, node);
        Ok(())
    }

    /// spec §4.1: "If the new sample itself is already ack'd and `tldepth
    /// < idxdepth`, also prune the sample that just fell off the
    /// transient-local window."
    fn prune_transient_local_boundary(&self, inner: &mut Inner, tk: InstanceHandle) {
        let boundary_seq = {
            let Some(idxnode) = inner.idx.get(&tk) else {
                return;
            };
            let d = idxnode.hist.len();
            let pos = (idxnode.headidx + d - self.tldepth.min(d)) % d;
            idxnode.hist[pos]
        };
        if let Some(seq) = boundary_seq {
            if seq <= inner.max_drop_seq {
                if let Some(freed) = inner.unlink(seq) {
                    self.release_payload(&freed.payload);
                    self.freelist.push(freed);
                }
            }
        }
    }

    /// Advance the acknowledgment boundary (spec §4.1
    /// `remove_acked_messages`). Returns the retired nodes (the caller is
    /// responsible for eventually calling
    /// [`free_deferred_free_list`](Self::free_deferred_free_list)).
    pub fn remove_acked_messages(&self, max_drop_seq: u64) -> Vec<Node> {
        let mut inner = self.lock();
        if max_drop_seq <= inner.max_drop_seq {
            return Vec::new();
        }
        let prev = inner.max_drop_seq;
        inner.max_drop_seq = max_drop_seq;

        if self.fast_path_eligible() {
            return self.remove_acked_fast_path(&mut inner, prev, max_drop_seq);
        }
        self.remove_acked_full_path(&mut inner, prev, max_drop_seq)
    }

    fn remove_acked_fast_path(
        &self,
        inner: &mut Inner,
        prev_max_drop_seq: u64,
        max_drop_seq: u64,
    ) -> Vec<Node> {
        let mut dropped = Vec::new();
        for seq in (prev_max_drop_seq + 1)..=max_drop_seq {
            if let Some(node) = inner.unlink(seq) {
                dropped.push(node);
            }
        }
        dropped
    }

    fn remove_acked_full_path(
        &self,
        inner: &mut Inner,
        prev_max_drop_seq: u64,
        max_drop_seq: u64,
    ) -> Vec<Node> {
        let mut dropped = Vec::new();
        for seq in (prev_max_drop_seq + 1)..=max_drop_seq {
            let Some(node) = inner.seq_hash.get(&seq) else {
                continue;
            };
            let in_tl_window = node.instance.and_then(|tk| inner.idx.get(&tk)).is_some_and(
                |idxnode| idxnode.is_within_recent(seq, self.tldepth.max(1)),
            );
            if in_tl_window {
                if let Some(node) = inner.seq_hash.get_mut(&seq) {
                    if node.unacked {
                        inner.unacked_bytes = inner.unacked_bytes.saturating_sub(node.size);
                        node.unacked = false;
                    }
                }
            } else {
                if let Some(node) = inner.unlink(seq) {
                    dropped.push(node);
                }
            }
        }

        if self.tldepth < self.idxdepth {
            let instances: Vec<InstanceHandle> = inner
                .idx
                .iter()
                .filter(|(_, idxnode)| idxnode.prune_seq < max_drop_seq)
                .map(|(&tk, _)| tk)
                .collect();
            for tk in instances {
                let stale: Vec<u64> = {
                    let Some(idxnode) = inner.idx.get(&tk) else {
                        continue;
                    };
                    let recent = idxnode.recent_window(self.tldepth);
                    let d = idxnode.hist.len();
                    idxnode
                        .hist
                        .iter()
                        .filter_map(|s| *s)
                        .filter(|s| !recent.contains(s) && *s <= max_drop_seq)
                        .collect::<std::collections::HashSet<_>>()
                        .into_iter()
                        .collect::<Vec<_>>()
                        .into_iter()
                        .take(d)
                        .collect()
                };
                for seq in stale {
                    if let Some(node) = inner.unlink(seq) {
                        dropped.push(node);
                    }
                }
                if let Some(idxnode) = inner.idx.get_mut(&tk) {
                    idxnode.prune_seq = max_drop_seq;
                }
            }
        }

        dropped
    }

    /// Borrow a sample by sequence number for retransmission (spec §4.1
    /// `borrow_sample`). Returns `None` if the sequence is unknown or
    /// already borrowed.
    pub fn borrow_sample(&self, seq: u64) -> Option<BorrowedSample> {
        let mut inner = self.lock();
        let node = inner.seq_hash.get_mut(&seq)?;
        if node.borrowed {
            return None;
        }
        node.borrowed = true;
        node.retransmit_count += 1;
        node.last_retransmit = Some(std::time::Instant::now());
        Some(BorrowedSample {
            seq,
            payload: node.payload.clone(),
            retransmit_count: node.retransmit_count,
        })
    }

    /// Borrow the current (head) sample of an instance by key, used for
    /// late-joiner point lookups (spec §4.1 `borrow_sample_key`). The
    /// caller resolves `key_bytes` to an [`InstanceHandle`] via the shared
    /// `TkMap` before calling.
    pub fn borrow_sample_key(&self, tk: InstanceHandle) -> Option<BorrowedSample> {
        let seq = {
            let inner = self.lock();
            inner.idx.get(&tk).and_then(|idx| idx.head_seq())?
        };
        self.borrow_sample(seq)
    }

    /// Release a borrow obtained from [`borrow_sample`](Self::borrow_sample)
    /// or the sample iterator. A no-op borrow/return pair (spec §8
    /// "Round-trips and idempotence") is handled correctly since nothing
    /// else on the node's data is mutated here.
    pub fn return_borrow(&self, seq: u64) {
        let mut inner = self.lock();
        if let Some(node) = inner.seq_hash.get_mut(&seq) {
            node.borrowed = false;
        }
    }

    /// Begin iterating historical samples for a newly matched
    /// transient-local reader (spec §4.1 `sample_iter_init`, §8 scenario 3).
    pub fn sample_iter_init(&self) -> WhcSampleIter<'_> {
        let inner = self.lock();
        let mut seqs: Vec<u64> = inner
            .idx
            .values()
            .flat_map(|idx| idx.recent_window(self.tldepth))
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        WhcSampleIter {
            whc: self,
            queue: seqs.into(),
            current: None,
        }
    }

    /// Identify which of a nacked reader's `missing` sequence numbers the
    /// WHC has permanently dropped or skipped (spec §6.1 GAP: "Announces
    /// sequence numbers the writer will never send"), coalesced into
    /// half-open `[first, lastp1)` ranges in the order
    /// `nn_gap_info_init`/`nn_gap_info_update` accumulate them in the
    /// teacher's source (`q_transmit.c`).
    ///
    /// A sequence is gone for good, rather than simply not-yet-assigned,
    /// when the writer has already reached it (`seq <= max_seq`) but it is
    /// absent from the sequence-hash index — e.g. the unregister-drop of
    /// spec §3.6, or an interval gap left by a content filter. Sequences
    /// the writer has not assigned yet are left out: a reader nacking
    /// ahead of the writer is not a gap, just premature.
    pub fn gap_ranges(&self, missing: &[u64]) -> Vec<(u64, u64)> {
        let inner = self.lock();
        let Some(max_seq) = inner.intervals.max_seq() else {
            return Vec::new();
        };
        let mut gone: Vec<u64> = missing
            .iter()
            .copied()
            .filter(|&seq| seq <= max_seq && !inner.seq_hash.contains_key(&seq))
            .collect();
        gone.sort_unstable();
        gone.dedup();

        let mut ranges = Vec::new();
        let mut iter = gone.into_iter();
        if let Some(first) = iter.next() {
            let (mut start, mut prev) = (first, first);
            for seq in iter {
                if seq == prev + 1 {
                    prev = seq;
                } else {
                    ranges.push((start, prev + 1));
                    start = seq;
                    prev = seq;
                }
            }
            ranges.push((start, prev + 1));
        }
        ranges
    }

    pub fn get_state(&self) -> WhcState {
        let inner = self.lock();
        WhcState {
            min_seq: inner.intervals.min_seq(),
            max_seq: inner.intervals.max_seq(),
            unacked_bytes: inner.unacked_bytes,
        }
    }

    /// Release a previously returned deferred-free list (spec §4.1
    /// `free_deferred_free_list`).
    pub fn free_deferred_free_list(&self, list: Vec<Node>) {
        for node in list {
            self.release_payload(&node.payload);
            self.freelist.push(node);
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }
}

/// A sample handed out by [`WriterHistoryCache::borrow_sample`] or the
/// sample iterator.
#[derive(Debug, Clone)]
pub struct BorrowedSample {
    pub seq: u64,
    pub payload: Payload,
    pub retransmit_count: u32,
}

/// Drives historical-data delivery to a transient-local late joiner (spec
/// §4.1 `sample_iter_borrow_next`). Each yielded sample stays borrowed
/// until the next call or until the iterator is dropped.
pub struct WhcSampleIter<'a> {
    whc: &'a WriterHistoryCache,
    queue: VecDeque<u64>,
    current: Option<u64>,
}

impl<'a> WhcSampleIter<'a> {
    pub fn borrow_next(&mut self) -> Option<BorrowedSample> {
        if let Some(seq) = self.current.take() {
            self.whc.return_borrow(seq);
        }
        while let Some(seq) = self.queue.pop_front() {
            if let Some(sample) = self.whc.borrow_sample(seq) {
                self.current = Some(seq);
                return Some(sample);
            }
        }
        None
    }
}

impl<'a> Drop for WhcSampleIter<'a> {
    fn drop(&mut self) {
        if let Some(seq) = self.current.take() {
            self.whc.return_borrow(seq);
        }
    }
}
