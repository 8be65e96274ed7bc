// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sample and per-instance node shapes (spec §3.6).

use std::sync::Arc;
use std::time::Instant;

use crate::instance::InstanceHandle;
use crate::rt::slabpool::SlabHandle;

/// A sample's serialized payload: slab-allocated when it fits a size class
/// (the common case, avoiding a heap allocation per sample per spec
/// SPEC_FULL §B), or a plain heap buffer for oversize samples the slab
/// pool's largest class (128KB) cannot hold.
#[derive(Debug, Clone)]
pub enum Payload {
    Slab { handle: SlabHandle, len: usize },
    Heap(Arc<[u8]>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Slab { len, .. } => *len,
            Payload::Heap(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `SDK_EMPTY` / unregister-with-no-data marker from spec §4.1 "Sample
/// insertion": distinguishes a normal write from an unregister or dispose
/// that carries no application payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusInfo {
    Write,
    Unregister,
    Dispose,
}

impl StatusInfo {
    pub fn is_empty_sample(self) -> bool {
        matches!(self, StatusInfo::Unregister)
    }
}

/// One entry in the WHC's sequence administration (spec §3.6 "Each sample
/// node carries...").
#[derive(Debug, Clone)]
pub struct Node {
    pub seq: u64,
    pub size: usize,
    pub last_retransmit: Option<Instant>,
    pub retransmit_count: u32,
    pub unacked: bool,
    pub borrowed: bool,
    pub instance: Option<InstanceHandle>,
    pub status_info: StatusInfo,
    pub payload: Payload,
    /// Position of this node within its owning idxnode's circular buffer,
    /// `None` for unregister/empty samples that never enter the per-instance
    /// index.
    pub instance_slot: Option<usize>,
}

impl Node {
    pub fn new(seq: u64, payload: Payload, status_info: StatusInfo, unacked: bool) -> Self {
        let size = payload.len();
        Self {
            seq,
            size,
            last_retransmit: None,
            retransmit_count: 0,
            unacked,
            borrowed: false,
            instance: None,
            status_info,
            payload,
            instance_slot: None,
        }
    }
}

/// Per-instance circular buffer of at most `idxdepth` sample nodes (spec
/// §3.6 "Per-instance index").
#[derive(Debug)]
pub struct IdxNode {
    /// Sequence numbers of the samples currently occupying each slot;
    /// `None` marks a hole left by a prune (spec invariant: "earlier slots
    /// may be null ... but are never observed as stale").
    pub hist: Vec<Option<u64>>,
    pub headidx: usize,
    /// Sequence number below which this instance has already been
    /// considered during `remove_acked_messages`'s second pass (spec §4.1).
    pub prune_seq: u64,
}

impl IdxNode {
    pub fn new(idxdepth: usize) -> Self {
        Self {
            hist: vec![None; idxdepth.max(1)],
            headidx: 0,
            prune_seq: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.hist.len()
    }

    /// Advance the head cursor and return the sequence number that used to
    /// occupy the new head slot, if any (the sample about to be overwritten,
    /// spec §4.1 "advance headidx, overwrite the slot at the new head").
    pub fn advance_and_take(&mut self, new_seq: u64) -> Option<u64> {
        self.headidx = (self.headidx + 1) % self.hist.len();
        let evicted = self.hist[self.headidx].take();
        self.hist[self.headidx] = Some(new_seq);
        evicted
    }

    pub fn head_seq(&self) -> Option<u64> {
        self.hist[self.headidx]
    }

    pub fn clear_seq(&mut self, seq: u64) {
        for slot in &mut self.hist {
            if *slot == Some(seq) {
                *slot = None;
            }
        }
    }

    /// True if `seq` occupies one of the `tldepth` most recent slots
    /// counting back from `headidx` (spec §4.1 "still reachable from the
    /// current keep-last window (`whcn_in_tlidx`)").
    pub fn is_within_recent(&self, seq: u64, tldepth: usize) -> bool {
        let d = self.hist.len();
        let window = tldepth.min(d);
        for i in 0..window {
            let pos = (self.headidx + d - i) % d;
            if self.hist[pos] == Some(seq) {
                return true;
            }
        }
        false
    }

    /// All sequence numbers within the `tldepth` most recent slots, in
    /// ascending order — the window delivered to a newly matched
    /// transient-local reader (spec §3.6 GLOSSARY, §8 scenario 3).
    pub fn recent_window(&self, tldepth: usize) -> Vec<u64> {
        let d = self.hist.len();
        let window = tldepth.min(d);
        let mut out: Vec<u64> = (0..window)
            .filter_map(|i| {
                let pos = (self.headidx + d - i) % d;
                self.hist[pos]
            })
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idxnode_advance_evicts_oldest_on_wraparound() {
        let mut idx = IdxNode::new(2);
        assert_eq!(idx.advance_and_take(1), None);
        assert_eq!(idx.advance_and_take(2), None);
        // Third write wraps back to slot 0, evicting seq 1.
        assert_eq!(idx.advance_and_take(3), Some(1));
        assert_eq!(idx.head_seq(), Some(3));
    }
}
