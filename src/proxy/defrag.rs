// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Defragmentation buffer (spec §3.5).
//!
//! Reassembles a `DATA_FRAG` fragment train into the original payload
//! before it is handed to the reorder buffer. One instance per proxy
//! writer; per-sequence-number reassembly state is dropped as soon as the
//! last fragment arrives or the sample is superseded.

use std::collections::HashMap;

struct PartialSample {
    total_size: usize,
    fragment_size: usize,
    fragments: HashMap<u32, Vec<u8>>,
}

impl PartialSample {
    fn is_complete(&self) -> bool {
        let expected = (self.total_size + self.fragment_size - 1) / self.fragment_size.max(1);
        self.fragments.len() as u32 >= expected.max(1) as u32
    }

    fn assemble(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_size];
        for (index, bytes) in &self.fragments {
            let offset = *index as usize * self.fragment_size;
            let end = (offset + bytes.len()).min(self.total_size);
            if offset < self.total_size {
                out[offset..end].copy_from_slice(&bytes[..end - offset]);
            }
        }
        out
    }
}

/// Per-proxy-writer fragment reassembly table (spec §3.5 "a
/// defragmentation buffer").
#[derive(Default)]
pub struct DefragBuffer {
    by_seq: HashMap<u64, PartialSample>,
    max_samples: usize,
}

impl DefragBuffer {
    pub fn new(max_samples: usize) -> Self {
        Self {
            by_seq: HashMap::new(),
            max_samples,
        }
    }

    /// Feed one `DATA_FRAG` fragment. Returns the reassembled payload once
    /// every fragment for `seq` has arrived.
    pub fn receive_fragment(
        &mut self,
        seq: u64,
        fragment_index: u32,
        fragment_size: usize,
        total_size: usize,
        bytes: Vec<u8>,
    ) -> Option<Vec<u8>> {
        if !self.by_seq.contains_key(&seq) && self.by_seq.len() >= self.max_samples {
            log::debug!("defrag buffer at capacity ({}), dropping fragment for seq {seq}", self.max_samples);
            return None;
        }
        let entry = self.by_seq.entry(seq).or_insert_with(|| PartialSample {
            total_size,
            fragment_size,
            fragments: HashMap::new(),
        });
        entry.fragments.insert(fragment_index, bytes);
        if entry.is_complete() {
            let sample = self.by_seq.remove(&seq)?;
            return Some(sample.assemble());
        }
        None
    }

    /// Drop any in-progress reassembly for `seq` (e.g. superseded by a GAP).
    pub fn discard(&mut self, seq: u64) {
        self.by_seq.remove(&seq);
    }

    pub fn in_progress_count(&self) -> usize {
        self.by_seq.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_in_order_fragments() {
        let mut defrag = DefragBuffer::new(16);
        assert!(defrag.receive_fragment(1, 0, 4, 8, vec![1, 2, 3, 4]).is_none());
        let full = defrag.receive_fragment(1, 1, 4, 8, vec![5, 6, 7, 8]).unwrap();
        assert_eq!(full, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let mut defrag = DefragBuffer::new(16);
        assert!(defrag.receive_fragment(1, 1, 4, 7, vec![5, 6, 7]).is_none());
        let full = defrag.receive_fragment(1, 0, 4, 7, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(full, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn discard_drops_partial_state() {
        let mut defrag = DefragBuffer::new(16);
        defrag.receive_fragment(1, 0, 4, 8, vec![1, 2, 3, 4]);
        assert_eq!(defrag.in_progress_count(), 1);
        defrag.discard(1);
        assert_eq!(defrag.in_progress_count(), 0);
    }
}
