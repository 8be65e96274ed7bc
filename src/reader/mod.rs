// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The local `Reader` entity (spec §3.4): ties the matching engine's
//! [`ReaderEndpoint`](crate::matching::ReaderEndpoint) and its matched
//! [`ProxyWriter`]s together into the receiving data path spec §2
//! describes: "receive path → reorder buffer → per-reader history cache →
//! application (... only their points of contact with matching and
//! heartbeats)". Sample storage itself (the RHC) is the out-of-scope
//! collaborator named in spec §1; this module only owns the contact
//! points — delivering reassembled/reordered samples to it, and turning
//! HEARTBEATs into ACKNACKs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use crate::config::ReliabilityConfig;
use crate::guid::Guid;
use crate::matching::reader_match::ReaderMatchRecord;
use crate::matching::ReaderEndpoint;
use crate::proxy::ProxyWriter;
use crate::reliability::acknack::AckNack;
use crate::wire::{GapMsg, HeartbeatMsg};

/// Out-of-scope collaborator (spec §1 "OUT OF SCOPE"... reorder buffer and
/// receive path are not covered here): the per-reader history cache a
/// `Reader` delivers reassembled, in-order samples into.
pub trait ReaderHistoryCache: Send + Sync {
    fn store(&self, writer: Guid, seq: u64, payload: Vec<u8>);
    fn notify_liveliness_changed(&self, writer: Guid, alive: bool);
}

/// The local reader entity (spec §3.4).
pub struct Reader {
    pub endpoint: Arc<ReaderEndpoint>,
    proxy_writers: RwLock<HashMap<Guid, Arc<ProxyWriter>>>,
    rhc: Arc<dyn ReaderHistoryCache>,
    reliability_cfg: ReliabilityConfig,
}

impl Reader {
    pub fn new(endpoint: Arc<ReaderEndpoint>, rhc: Arc<dyn ReaderHistoryCache>, reliability_cfg: ReliabilityConfig) -> Self {
        Self {
            endpoint,
            proxy_writers: RwLock::new(HashMap::new()),
            rhc,
            reliability_cfg,
        }
    }

    pub fn reliability_cfg(&self) -> &ReliabilityConfig {
        &self.reliability_cfg
    }

    fn proxy_writer(&self, writer: &Guid) -> Option<Arc<ProxyWriter>> {
        self.proxy_writers.read().expect("reader proxy writer map lock").get(writer).cloned()
    }

    /// spec §4.2 step 5 (reader side): successful match inserts a
    /// `prd_wr_match` and begins delivery from `proxy`.
    pub fn insert_proxy_writer(&self, proxy: Arc<ProxyWriter>) {
        if let Ok(mut matches) = self.endpoint.matches.write() {
            matches.insert(ReaderMatchRecord::new(proxy.guid));
        }
        self.proxy_writers.write().expect("reader proxy writer map lock").insert(proxy.guid, proxy);
    }

    pub fn remove_proxy_writer(&self, writer: &Guid) {
        if let Ok(mut matches) = self.endpoint.matches.write() {
            matches.remove(writer);
        }
        self.proxy_writers.write().expect("reader proxy writer map lock").remove(writer);
    }

    /// Feed one complete DATA sample; delivers every sample the reorder
    /// buffer can now release, in order.
    pub fn receive_data(&self, writer: Guid, seq: u64, payload: Vec<u8>) {
        let Some(proxy) = self.proxy_writer(&writer) else {
            return;
        };
        for (seq, payload) in proxy.receive_sample(seq, payload) {
            self.rhc.store(writer, seq, payload);
        }
    }

    /// Feed one DATA_FRAG fragment; delivers whatever the defrag + reorder
    /// pipeline releases once reassembly completes.
    pub fn receive_data_frag(
        &self,
        writer: Guid,
        seq: u64,
        fragment_index: u32,
        fragment_size: usize,
        total_size: usize,
        bytes: Vec<u8>,
    ) {
        let Some(proxy) = self.proxy_writer(&writer) else {
            return;
        };
        for (seq, payload) in proxy.receive_fragment(seq, fragment_index, fragment_size, total_size, bytes) {
            self.rhc.store(writer, seq, payload);
        }
    }

    /// GAP submessage (spec §6.1 GAP row): advance the delivery cursor past
    /// the contiguous run `gap_start, gap_start+1, ...` the gap list
    /// extends, without blocking on samples that remain genuinely missing
    /// past that run (those stay nackable).
    pub fn receive_gap(&self, writer: Guid, gap: &GapMsg) {
        let Some(proxy) = self.proxy_writer(&writer) else {
            return;
        };
        // gap_start is always irrecoverably missing; gap_list extends that
        // run with further contiguous entries until the first one that
        // isn't adjacent (an irregular entry beyond the run stays nackable).
        let mut sorted = gap.gap_list.clone();
        sorted.sort_unstable();
        let mut cursor = gap.gap_start;
        for s in sorted {
            if s == cursor + 1 {
                cursor += 1;
            } else if s > cursor + 1 {
                break;
            }
        }
        proxy.receive_gap(cursor + 1);
    }

    /// Turn a HEARTBEAT into an ACKNACK (spec §6.1 ACKNACK row, §4.3
    /// "Heartbeat-ack-required decision" mirrored on the reader side).
    /// Returns `None` when the heartbeat is stale (already seen a higher
    /// count) or when `FINAL` is set and nothing is missing.
    pub fn process_heartbeat(&self, writer: Guid, hb: &HeartbeatMsg) -> Option<AckNack> {
        let proxy = self.proxy_writer(&writer)?;
        if hb.flags.liveliness_flag {
            proxy.renew_lease();
        }
        if !proxy.note_heartbeat(hb.count) {
            return None;
        }

        let missing = proxy.missing_below(hb.last_sn + 1);
        if hb.flags.final_flag && missing.is_empty() {
            return None;
        }

        let count = self
            .endpoint
            .matches
            .write()
            .expect("reader match tree lock")
            .next_acknack_count();

        Some(AckNack {
            reader_sn_state_base: proxy.last_delivered_seq() + 1,
            missing,
            count,
            final_flag: true,
        })
    }

    /// Liveliness propagation, reader side (spec §4.2 "Liveliness
    /// propagation", §8 scenario 6): flip a matched writer's alive state,
    /// advance its vclock, and hand the transition to the RHC collaborator.
    pub fn mark_writer_liveliness(&self, writer: Guid, alive: bool) {
        let Some(proxy) = self.proxy_writer(&writer) else {
            return;
        };
        let vclock = proxy.set_alive(alive);
        if let Ok(mut matches) = self.endpoint.matches.write() {
            if let Some(record) = matches.get_mut(&writer) {
                record.alive = alive;
                record.alive_vclock = vclock;
            }
        }
        self.rhc.notify_liveliness_changed(writer, alive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::ReaderQos;
    use crate::wire::HeartbeatFlags;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRhc {
        stored: Mutex<Vec<(Guid, u64, Vec<u8>)>>,
        liveliness: Mutex<Vec<(Guid, bool)>>,
    }

    impl ReaderHistoryCache for FakeRhc {
        fn store(&self, writer: Guid, seq: u64, payload: Vec<u8>) {
            self.stored.lock().unwrap().push((writer, seq, payload));
        }

        fn notify_liveliness_changed(&self, writer: Guid, alive: bool) {
            self.liveliness.lock().unwrap().push((writer, alive));
        }
    }

    fn guid(n: u8) -> Guid {
        Guid::new([n; 12], [0, 0, 0, 2])
    }

    fn reader_with_rhc() -> (Reader, Arc<FakeRhc>) {
        let endpoint = Arc::new(ReaderEndpoint::new(guid(1), "Topic", "Type", false, ReaderQos::default()));
        let rhc = Arc::new(FakeRhc::default());
        let reader = Reader::new(endpoint, rhc.clone(), ReliabilityConfig::default());
        (reader, rhc)
    }

    #[test]
    fn matching_a_proxy_writer_registers_it_in_both_places() {
        let (reader, _rhc) = reader_with_rhc();
        let pw = Arc::new(ProxyWriter::new(guid(9), 16, 16));
        reader.insert_proxy_writer(Arc::clone(&pw));
        assert_eq!(reader.endpoint.matches.read().unwrap().len(), 1);
        assert!(reader.proxy_writer(&guid(9)).is_some());
        reader.remove_proxy_writer(&guid(9));
        assert_eq!(reader.endpoint.matches.read().unwrap().len(), 0);
    }

    #[test]
    fn in_order_sample_is_delivered_to_rhc() {
        let (reader, rhc) = reader_with_rhc();
        reader.insert_proxy_writer(Arc::new(ProxyWriter::new(guid(9), 16, 16)));
        reader.receive_data(guid(9), 1, vec![1, 2, 3]);
        let stored = rhc.stored.lock().unwrap();
        assert_eq!(*stored, vec![(guid(9), 1, vec![1, 2, 3])]);
    }

    #[test]
    fn fragmented_sample_delivers_once_complete() {
        let (reader, rhc) = reader_with_rhc();
        reader.insert_proxy_writer(Arc::new(ProxyWriter::new(guid(9), 16, 16)));
        reader.receive_data_frag(guid(9), 1, 0, 4, 8, vec![1, 2, 3, 4]);
        assert!(rhc.stored.lock().unwrap().is_empty());
        reader.receive_data_frag(guid(9), 1, 1, 4, 8, vec![5, 6, 7, 8]);
        assert_eq!(rhc.stored.lock().unwrap().len(), 1);
    }

    #[test]
    fn heartbeat_with_missing_samples_yields_acknack() {
        let (reader, _rhc) = reader_with_rhc();
        reader.insert_proxy_writer(Arc::new(ProxyWriter::new(guid(9), 16, 16)));
        let hb = HeartbeatMsg {
            writer_id: [0, 0, 0, 2],
            reader_id: [0, 0, 0, 7],
            first_sn: 1,
            last_sn: 3,
            count: 1,
            flags: HeartbeatFlags::default(),
            latency_timestamp: None,
        };
        let ack = reader.process_heartbeat(guid(9), &hb).unwrap();
        assert_eq!(ack.missing, vec![1, 2, 3]);
        assert_eq!(ack.reader_sn_state_base, 1);
    }

    #[test]
    fn stale_heartbeat_count_is_ignored() {
        let (reader, _rhc) = reader_with_rhc();
        reader.insert_proxy_writer(Arc::new(ProxyWriter::new(guid(9), 16, 16)));
        let hb = HeartbeatMsg {
            writer_id: [0, 0, 0, 2],
            reader_id: [0, 0, 0, 7],
            first_sn: 1,
            last_sn: 1,
            count: 5,
            flags: HeartbeatFlags::default(),
            latency_timestamp: None,
        };
        assert!(reader.process_heartbeat(guid(9), &hb).is_some());
        assert!(reader.process_heartbeat(guid(9), &hb).is_none(), "same count must not re-ack");
    }

    #[test]
    fn final_heartbeat_with_nothing_missing_suppresses_acknack() {
        let (reader, _rhc) = reader_with_rhc();
        reader.insert_proxy_writer(Arc::new(ProxyWriter::new(guid(9), 16, 16)));
        reader.receive_data(guid(9), 1, vec![1]);
        let hb = HeartbeatMsg {
            writer_id: [0, 0, 0, 2],
            reader_id: [0, 0, 0, 7],
            first_sn: 1,
            last_sn: 1,
            count: 1,
            flags: HeartbeatFlags {
                final_flag: true,
                liveliness_flag: false,
            },
            latency_timestamp: None,
        };
        assert!(reader.process_heartbeat(guid(9), &hb).is_none());
    }

    #[test]
    fn gap_advances_cursor_over_contiguous_run() {
        let (reader, _rhc) = reader_with_rhc();
        let pw = Arc::new(ProxyWriter::new(guid(9), 16, 16));
        reader.insert_proxy_writer(Arc::clone(&pw));
        let gap = GapMsg {
            reader_id: [0, 0, 0, 7],
            writer_id: [0, 0, 0, 2],
            gap_start: 1,
            gap_list: vec![2, 3],
        };
        reader.receive_gap(guid(9), &gap);
        assert_eq!(pw.last_delivered_seq(), 3);
    }

    #[test]
    fn liveliness_flip_updates_match_record_and_notifies_rhc() {
        // spec §8 scenario 6.
        let (reader, rhc) = reader_with_rhc();
        reader.insert_proxy_writer(Arc::new(ProxyWriter::new(guid(9), 16, 16)));
        reader.mark_writer_liveliness(guid(9), false);
        reader.mark_writer_liveliness(guid(9), true);
        let events = rhc.liveliness.lock().unwrap();
        assert_eq!(*events, vec![(guid(9), false), (guid(9), true)]);
        let matches = reader.endpoint.matches.read().unwrap();
        let record = matches.get(&guid(9)).unwrap();
        assert!(record.alive);
        assert!(record.alive_vclock > 0);
    }
}
