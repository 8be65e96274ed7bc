// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The local `Writer` entity (spec §3.3): ties the matching engine's
//! [`WriterEndpoint`](crate::matching::WriterEndpoint), the [`WriterHistoryCache`],
//! and the reliability/heartbeat scheduler together into the publishing
//! data path spec §2 describes: "application → writer::insert → WHC →
//! reliability scheduler → transmit queue."

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{ReliabilityConfig, WhcConfig};
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::instance::SharedTkMap;
use crate::matching::writer_match::WriterMatchRecord;
use crate::matching::WriterEndpoint;
use crate::proxy::ProxyReader;
use crate::reliability::acknack::{AckNack, RetransmitEngine, RetransmitFragment};
use crate::reliability::heartbeat::{HeartbeatDecision, HeartbeatState};
use crate::reliability::throttle::WriterThrottle;
use crate::rt::slabpool::SlabPool;
use crate::whc::node::StatusInfo;
use crate::whc::{NodeFreeList, WriterHistoryCache};
use crate::wire::GapMsg;

/// Where a transmit batch should go (spec §4.3 "Destination selection").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Multicast,
    Unicast(Guid),
}

/// What a call to [`Writer::write`] asks the transmit path to do about a
/// heartbeat alongside the data (spec §4.3 "Piggyback on data").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub seq: u64,
    pub piggyback_heartbeat: bool,
}

/// What to transmit in response to an ACKNACK (spec §4.3 "Retransmission",
/// spec §6.1 GAP row). A reader nacking a sequence number the WHC has
/// already dropped or skipped (e.g. the unregister-drop of spec §3.6) gets
/// a GAP instead of being left to nack the same hole forever.
#[derive(Debug, Clone, Default)]
pub struct AckNackResponse {
    pub retransmits: Vec<RetransmitFragment>,
    pub gaps: Vec<GapMsg>,
}

/// The local writer entity (spec §3.3).
pub struct Writer {
    pub endpoint: Arc<WriterEndpoint>,
    whc: WriterHistoryCache,
    heartbeat: HeartbeatState,
    throttle: WriterThrottle,
    reliability_cfg: ReliabilityConfig,
    whc_cfg: WhcConfig,
    /// Fragment size for retransmitted payloads, mirrors the domain
    /// config's `fragment_size` (spec §6.3) since `Writer` does not hold
    /// the whole `DomainConfig`.
    fragment_size: usize,
    tk_map: SharedTkMap,
    /// Remote matched readers, mirroring `endpoint.matches` but carrying the
    /// richer [`ProxyReader`] state matching needs for destination
    /// selection (spec §3.3 "transmit address set").
    proxy_readers: RwLock<HashMap<Guid, Arc<ProxyReader>>>,
    /// Monotonically increasing identifier of the current transmit packet;
    /// used only to detect "the packet boundary has been crossed" for
    /// piggyback decisions (spec §4.3).
    transmit_packet_id: AtomicU64,
    /// Serializes sequence-number assignment and WHC insertion, standing in
    /// for the source's "writer main lock" (spec §5 "Ordering guarantees":
    /// "Sample sequence numbers are assigned under the writer's main lock").
    write_lock: Mutex<()>,
}

impl Writer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Arc<WriterEndpoint>,
        idxdepth: usize,
        tldepth: usize,
        is_transient_local: bool,
        has_deadline: bool,
        slabpool: Arc<SlabPool>,
        freelist: Arc<NodeFreeList>,
        reliability_cfg: ReliabilityConfig,
        whc_cfg: WhcConfig,
        fragment_size: usize,
        tk_map: SharedTkMap,
    ) -> Self {
        Self {
            endpoint,
            whc: WriterHistoryCache::new(idxdepth, tldepth, is_transient_local, has_deadline, slabpool, freelist),
            heartbeat: HeartbeatState::new(),
            throttle: WriterThrottle::new(),
            reliability_cfg,
            whc_cfg,
            fragment_size,
            tk_map,
            proxy_readers: RwLock::new(HashMap::new()),
            transmit_packet_id: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn whc(&self) -> &WriterHistoryCache {
        &self.whc
    }

    pub fn heartbeat_state(&self) -> &HeartbeatState {
        &self.heartbeat
    }

    fn lock_write(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(g) => g,
            Err(p) => {
                log::debug!("writer main lock poisoned, recovering");
                p.into_inner()
            }
        }
    }

    /// Publish a sample (spec §2 data flow, §4.1 "Sample insertion", §4.3
    /// "Throttling"/"Piggyback on data").
    ///
    /// `key_bytes` is empty for unkeyed topics. Blocks inside
    /// [`WriterThrottle`] if `unacked_bytes > whc_high`, per spec §4.3.
    pub fn write(&self, key_bytes: &[u8], status_info: StatusInfo, payload: &[u8], packet_id: u64) -> Result<WriteOutcome> {
        self.throttle_if_needed()?;

        let _guard = self.lock_write();
        let seq = self.endpoint.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let tk = if key_bytes.is_empty() {
            crate::instance::InstanceHandle::NIL
        } else {
            self.tk_map.register(key_bytes)
        };

        let max_drop_seq = {
            let matches = self.endpoint.matches.read().map_err(|_| Error::PreconditionNotMet("writer match tree lock poisoned".into()))?;
            matches.writer_max_drop_seq()
        };

        self.whc.insert(max_drop_seq, seq, tk, status_info, payload)?;
        self.heartbeat.note_write();

        let piggyback_heartbeat = self.heartbeat.note_transmit_packet_id(packet_id);
        Ok(WriteOutcome { seq, piggyback_heartbeat })
    }

    /// spec §4.3 "Throttling": block while `unacked_bytes > whc_high`,
    /// forcing out a heartbeat first to hasten acks.
    fn throttle_if_needed(&self) -> Result<()> {
        if self.whc.get_state().unacked_bytes <= self.whc_cfg.whc_highwater_mark {
            return Ok(());
        }
        // Force an ack-requesting heartbeat before blocking; the caller's
        // transmit path is expected to honor `HeartbeatDecision::SendNow`
        // and actually emit it. We cannot send packets from here (no
        // transport dependency in the WHC/reliability layer), so we only
        // record the forced request.
        self.heartbeat.note_heartbeat_sent(true);
        self.throttle.wait_while_throttled(self.reliability_cfg.max_blocking_time, || {
            self.whc.get_state().unacked_bytes > self.whc_cfg.whc_highwater_mark
        })
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle.is_blocked()
    }

    /// Writer deletion unblocks throttled writers (spec §4.2 "State
    /// machines" `INTERRUPT`, §4.3 "Throttling").
    pub fn interrupt(&self) {
        self.throttle.interrupt();
    }

    /// Process an ACKNACK from a matched reader: update its acknowledgment
    /// state, recompute the drop boundary, prune the WHC, and return
    /// fragments to retransmit for anything it reported missing (spec §4.3
    /// "Retransmission"), plus GAPs for anything nacked that the WHC will
    /// never be able to resend (spec §6.1 GAP row).
    pub fn process_acknack(&self, reader: Guid, acknack: &AckNack, min_receive_buffer_size: usize, is_new_transmit: bool) -> Result<AckNackResponse> {
        let writer_seq = self.endpoint.seq.load(Ordering::Acquire);
        let new_max_drop_seq = {
            let mut matches = self.endpoint.matches.write().map_err(|_| Error::PreconditionNotMet("writer match tree lock poisoned".into()))?;
            // The reader has acknowledged everything strictly below its
            // reported base; anything it still lists as missing stays
            // unacked.
            let acked_through = acknack.reader_sn_state_base.saturating_sub(1);
            matches.update_ack(&reader, acked_through, writer_seq);
            matches.writer_max_drop_seq()
        };

        let before = self.whc.get_state().unacked_bytes;
        let dropped = self.whc.remove_acked_messages(new_max_drop_seq);
        self.whc.free_deferred_free_list(dropped);
        let after = self.whc.get_state().unacked_bytes;
        if after < before && after <= self.whc_cfg.whc_lowwater_mark {
            self.throttle.notify_acked();
        }

        let gaps = self
            .whc
            .gap_ranges(&acknack.missing)
            .into_iter()
            .map(|(first, lastp1)| GapMsg::for_range(reader.entity_id, self.endpoint.guid.entity_id, first, lastp1))
            .collect();

        let engine = RetransmitEngine::new(&self.whc, self.fragment_size);
        let retransmits = engine.process(acknack, &self.reliability_cfg, min_receive_buffer_size, is_new_transmit);
        Ok(AckNackResponse { retransmits, gaps })
    }

    /// spec §4.3 "Must send a heartbeat?" / "Heartbeat-ack-required
    /// decision", parameterized on the configured watermarks.
    pub fn heartbeat_decision(&self) -> HeartbeatDecision {
        let unacked = self.whc.get_state().unacked_bytes;
        let interval = self.heartbeat.interval(
            &self.reliability_cfg,
            unacked,
            self.whc_cfg.whc_lowwater_mark,
            self.whc_cfg.whc_highwater_mark,
            self.is_throttled(),
        );
        self.heartbeat.ack_required_decision(&self.reliability_cfg, interval, unacked, self.whc_cfg.whc_lowwater_mark, self.whc_cfg.whc_highwater_mark)
    }

    pub fn insert_proxy_reader(&self, proxy: Arc<ProxyReader>, reliable: bool) -> Result<()> {
        let writer_seq = self.endpoint.seq.load(Ordering::Acquire);
        {
            let mut matches = self.endpoint.matches.write().map_err(|_| Error::PreconditionNotMet("writer match tree lock poisoned".into()))?;
            matches.insert(WriterMatchRecord::new(proxy.guid, reliable), writer_seq);
        }
        self.proxy_readers.write().expect("proxy reader map lock").insert(proxy.guid, proxy);
        Ok(())
    }

    pub fn remove_proxy_reader(&self, reader: &Guid) {
        let writer_seq = self.endpoint.seq.load(Ordering::Acquire);
        if let Ok(mut matches) = self.endpoint.matches.write() {
            matches.remove(reader, writer_seq);
        }
        self.proxy_readers.write().expect("proxy reader map lock").remove(reader);
    }

    /// spec §4.3 "Destination selection": multicast when the writer leads
    /// all readers or all reliable readers are equally up to date; unicast
    /// to the single lagging reliable reader; multicast otherwise.
    pub fn destination_selection(&self) -> Destination {
        let writer_seq = self.endpoint.seq.load(Ordering::Acquire);
        let matches = self.endpoint.matches.read().expect("writer match tree lock");
        let agg = matches.aggregate();
        if writer_seq != agg.max_seq {
            return Destination::Multicast;
        }
        let lagging: Vec<Guid> = matches
            .iter()
            .filter(|r| r.reliable && r.effective_seq(writer_seq) < writer_seq)
            .map(|r| r.reader)
            .collect();
        match lagging.len() {
            0 => Destination::Multicast,
            1 => Destination::Unicast(lagging[0]),
            _ => Destination::Multicast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::WriterQos;

    fn writer(whc_low: usize, whc_high: usize) -> Writer {
        let guid = Guid::new([3u8; 12], [0, 0, 0, 2]);
        let endpoint = Arc::new(WriterEndpoint::new(guid, "Topic", "Type", false, WriterQos::default()));
        let mut whc_cfg = WhcConfig::default();
        whc_cfg.whc_lowwater_mark = whc_low;
        whc_cfg.whc_highwater_mark = whc_high;
        Writer::new(
            endpoint,
            0,
            0,
            false,
            false,
            Arc::new(SlabPool::new()),
            NodeFreeList::new(64),
            ReliabilityConfig::default(),
            whc_cfg,
            1344,
            SharedTkMap::default(),
        )
    }

    #[test]
    fn write_assigns_strictly_increasing_sequence_numbers() {
        let w = writer(100, 1000);
        let a = w.write(b"", StatusInfo::Write, b"x", 1).unwrap();
        let b = w.write(b"", StatusInfo::Write, b"y", 1).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
    }

    #[test]
    fn packet_boundary_crossing_triggers_piggyback() {
        // spec §8 scenario 5.
        let w = writer(1_000_000, 5_000_000);
        let a = w.write(b"", StatusInfo::Write, b"x", 7).unwrap();
        let b = w.write(b"", StatusInfo::Write, b"y", 7).unwrap();
        let c = w.write(b"", StatusInfo::Write, b"z", 8).unwrap();
        assert!(!a.piggyback_heartbeat, "first write always reports a packet-id change");
        assert!(!b.piggyback_heartbeat, "same packet id as previous write");
        assert!(c.piggyback_heartbeat, "packet id advanced, piggyback expected");
    }

    #[test]
    fn keep_all_reliable_slow_reader_throttles_and_unblocks_on_ack() {
        // spec §8 scenario 2 (shrunk watermarks for a fast test).
        let w = writer(500, 1000);
        let guid = Guid::new([9u8; 12], [0, 0, 0, 7]);
        let pr = Arc::new(ProxyReader::new(guid, vec![], vec![]));
        w.insert_proxy_reader(Arc::clone(&pr), true).unwrap();

        for _ in 0..20 {
            let _ = w.write(b"", StatusInfo::Write, &vec![0u8; 100], 1);
        }
        assert!(w.whc().get_state().unacked_bytes > 500);

        // Ack everything; the writer should be unblockable (no waiter is
        // actually parked here since `write` returns before blocking in
        // this single-threaded test once past highwater, but the ack path
        // itself must not panic and must bring bytes back under lowwater).
        let ack = AckNack {
            reader_sn_state_base: 21,
            missing: vec![],
            count: 1,
            final_flag: true,
        };
        w.process_acknack(guid, &ack, 65536, false).unwrap();
        assert!(w.whc().get_state().unacked_bytes <= 500);
    }

    #[test]
    fn destination_selection_targets_the_sole_lagging_reliable_reader() {
        let w = writer(1_000_000, 5_000_000);
        let fast = Guid::new([1u8; 12], [0, 0, 0, 7]);
        let slow = Guid::new([2u8; 12], [0, 0, 0, 7]);
        w.insert_proxy_reader(Arc::new(ProxyReader::new(fast, vec![], vec![])), true).unwrap();
        w.insert_proxy_reader(Arc::new(ProxyReader::new(slow, vec![], vec![])), true).unwrap();

        w.write(b"", StatusInfo::Write, b"x", 1).unwrap();
        let fast_ack = AckNack {
            reader_sn_state_base: 2,
            missing: vec![],
            count: 1,
            final_flag: true,
        };
        w.process_acknack(fast, &fast_ack, 65536, false).unwrap();

        assert_eq!(w.destination_selection(), Destination::Unicast(slow));
    }
}
