// SPDX-License-Identifier: Apache-2.0 OR MIT

//! ACKNACK/NACK_FRAG processing and retransmit burst shaping (spec §4.3
//! "Retransmission").

use crate::config::ReliabilityConfig;
use crate::whc::WriterHistoryCache;

/// One fragment queued for retransmission.
#[derive(Debug, Clone)]
pub struct RetransmitFragment {
    pub seq: u64,
    pub fragment_index: u32,
    pub bytes: Vec<u8>,
}

/// A bitmap of sequence numbers a reader has reported missing, as carried
/// by an ACKNACK submessage (spec §3.7, wire format in spec §6.1).
#[derive(Debug, Clone)]
pub struct AckNack {
    pub reader_sn_state_base: u64,
    pub missing: Vec<u64>,
    pub count: u32,
    /// Whether this ACKNACK is asking for a response even with nothing
    /// missing (a "final" or preemptive keepalive probe).
    pub final_flag: bool,
}

/// Drives retransmission of samples a matched reader reported missing
/// (spec §4.3 "Retransmission").
pub struct RetransmitEngine<'a> {
    whc: &'a WriterHistoryCache,
    fragment_size: usize,
}

impl<'a> RetransmitEngine<'a> {
    pub fn new(whc: &'a WriterHistoryCache, fragment_size: usize) -> Self {
        Self { whc, fragment_size }
    }

    fn burst_limit(cfg: &ReliabilityConfig, min_receive_buffer_size: usize, is_new_transmit: bool) -> usize {
        let base = (min_receive_buffer_size * 2 / 3).min(cfg.max_rexmit_burst_size);
        if is_new_transmit {
            base.saturating_add(base * cfg.init_transmit_extra_pct as usize / 100)
        } else {
            base
        }
    }

    /// Process one ACKNACK, returning the fragments to retransmit. Nacks
    /// on a sample that is already `borrowed` (another retransmit in
    /// flight) are coalesced away — the in-flight attempt will service
    /// the reader too.
    pub fn process(
        &self,
        acknack: &AckNack,
        cfg: &ReliabilityConfig,
        min_receive_buffer_size: usize,
        is_new_transmit: bool,
    ) -> Vec<RetransmitFragment> {
        let burst_cap = Self::burst_limit(cfg, min_receive_buffer_size, is_new_transmit);
        let mut out = Vec::new();
        let mut budget = burst_cap;

        for &seq in &acknack.missing {
            if budget == 0 {
                break;
            }
            let Some(sample) = self.whc.borrow_sample(seq) else {
                // Either unknown (already pruned) or already borrowed by
                // another in-flight retransmit; either way, coalesce.
                continue;
            };
            let bytes = self.whc.payload_bytes(&sample.payload);
            let fragments = Self::split_into_fragments(&bytes, self.fragment_size);
            for (index, chunk) in fragments.into_iter().enumerate() {
                if budget == 0 {
                    break;
                }
                let take = chunk.len().min(budget);
                budget -= take;
                out.push(RetransmitFragment {
                    seq,
                    fragment_index: index as u32,
                    bytes: chunk,
                });
            }
            self.whc.return_borrow(seq);
        }

        out
    }

    fn split_into_fragments(bytes: &[u8], fragment_size: usize) -> Vec<Vec<u8>> {
        if fragment_size == 0 || bytes.len() <= fragment_size {
            return vec![bytes.to_vec()];
        }
        bytes.chunks(fragment_size).map(|c| c.to_vec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceHandle;
    use crate::rt::slabpool::SlabPool;
    use crate::whc::{node::StatusInfo, NodeFreeList};
    use std::sync::Arc;

    fn whc() -> WriterHistoryCache {
        WriterHistoryCache::new(0, 0, false, false, Arc::new(SlabPool::new()), NodeFreeList::new(64))
    }

    #[test]
    fn nack_on_unknown_sequence_is_coalesced_away() {
        let w = whc();
        let cfg = ReliabilityConfig::default();
        let engine = RetransmitEngine::new(&w, 1344);
        let nack = AckNack {
            reader_sn_state_base: 1,
            missing: vec![42],
            count: 1,
            final_flag: false,
        };
        let out = engine.process(&nack, &cfg, 65536, false);
        assert!(out.is_empty());
    }

    #[test]
    fn oversize_sample_splits_into_multiple_fragments() {
        let w = whc();
        let tk = InstanceHandle(1);
        let payload = vec![7u8; 3000];
        w.insert(0, 1, tk, StatusInfo::Write, &payload).unwrap();
        let cfg = ReliabilityConfig::default();
        let engine = RetransmitEngine::new(&w, 1344);
        let nack = AckNack {
            reader_sn_state_base: 1,
            missing: vec![1],
            count: 1,
            final_flag: false,
        };
        let out = engine.process(&nack, &cfg, 1 << 20, false);
        assert!(out.len() >= 3);
        assert!(!w.borrow_sample(1).is_none(), "sample must be returned after retransmit");
    }
}
