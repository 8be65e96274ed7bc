// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Endpoint Lifecycle & Matching Engine (spec §4.2).
//!
//! Drives endpoint creation, QoS compatibility checking, connection
//! insertion/removal, and liveliness-change notification.

pub mod lifecycle;
pub mod reader_match;
pub mod writer_match;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::entity::index::EntityIndex;
use crate::error::{Error, Result};
use crate::guid::{builtin_entity_id, EntityIdAllocator, EntityKind, Guid, GuidPrefix};
use crate::qos::{check_rxo, IgnoreLocal, QosPolicyId, ReaderQos, WriterQos};
use lifecycle::{ParticipantState, ReaderState, WriterState};
use reader_match::ReaderMatchTree;
use writer_match::WriterMatchTree;

/// Minimal description of a local writer endpoint as seen by the matching
/// engine (spec §3.3, §4.2).
pub struct WriterEndpoint {
    pub guid: Guid,
    pub topic: String,
    pub type_name: String,
    pub keyed: bool,
    pub qos: WriterQos,
    pub state: RwLock<WriterState>,
    pub matches: RwLock<WriterMatchTree>,
    pub seq: AtomicU64,
}

impl WriterEndpoint {
    pub fn new(guid: Guid, topic: impl Into<String>, type_name: impl Into<String>, keyed: bool, qos: WriterQos) -> Self {
        Self {
            guid,
            topic: topic.into(),
            type_name: type_name.into(),
            keyed,
            qos,
            state: RwLock::new(WriterState::Operational),
            matches: RwLock::new(WriterMatchTree::new()),
            seq: AtomicU64::new(0),
        }
    }
}

/// Minimal description of a local reader endpoint (spec §3.4, §4.2).
pub struct ReaderEndpoint {
    pub guid: Guid,
    pub topic: String,
    pub type_name: String,
    pub keyed: bool,
    pub qos: ReaderQos,
    pub state: RwLock<ReaderState>,
    pub matches: RwLock<ReaderMatchTree>,
}

impl ReaderEndpoint {
    pub fn new(guid: Guid, topic: impl Into<String>, type_name: impl Into<String>, keyed: bool, qos: ReaderQos) -> Self {
        Self {
            guid,
            topic: topic.into(),
            type_name: type_name.into(),
            keyed,
            qos,
            state: RwLock::new(ReaderState::Operational),
            matches: RwLock::new(ReaderMatchTree::new()),
        }
    }
}

/// Why a candidate writer/reader pair did not match (spec §4.2 "Matching").
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched,
    /// Topic check failed (entity-id kind mismatch, or keyed/no-key
    /// disagreement) — never surfaced as an incompatible-QoS event.
    TopicMismatch,
    IncompatibleQos(Vec<QosPolicyId>),
    SuppressedLocal,
}

/// A local participant record: the entity-id allocator, lease state, and
/// lifecycle tag (spec §4.2 `new_participant`).
pub struct Participant {
    pub guid: Guid,
    pub state: RwLock<ParticipantState>,
    pub entity_ids: EntityIdAllocator,
}

impl Participant {
    pub fn new(prefix: GuidPrefix) -> Self {
        Self {
            guid: Guid::new(prefix, builtin_entity_id::PARTICIPANT),
            state: RwLock::new(ParticipantState::Initializing),
            entity_ids: EntityIdAllocator::new(4),
        }
    }
}

/// The Endpoint Lifecycle & Matching Engine (spec §2, §4.2).
pub struct MatchingEngine {
    pub participants: EntityIndex<Participant>,
    pub writers: EntityIndex<WriterEndpoint>,
    pub readers: EntityIndex<ReaderEndpoint>,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchingEngine {
    pub fn new() -> Self {
        Self {
            participants: EntityIndex::new(),
            writers: EntityIndex::new(),
            readers: EntityIndex::new(),
        }
    }

    /// spec §4.2 `new_participant`: create a local participant and mark it
    /// operational. Builtin endpoint creation and SPDP publication are
    /// external collaborators (spec §1 OUT OF SCOPE); this records only
    /// the lifecycle transition the matching engine itself is responsible
    /// for gating application-thread access on.
    pub fn new_participant(&self, prefix: GuidPrefix) -> Guid {
        let participant = Arc::new(Participant::new(prefix));
        let guid = participant.guid;
        self.participants.insert(guid, "", Arc::clone(&participant));
        if let Ok(mut state) = participant.state.write() {
            *state = ParticipantState::Operational;
        }
        guid
    }

    pub fn new_writer_guid(
        &self,
        participant: &Participant,
        topic: impl Into<String>,
        type_name: impl Into<String>,
        keyed: bool,
        qos: WriterQos,
    ) -> Result<Guid> {
        qos.validate().map_err(Error::InvalidQos)?;
        let entity_id = participant.entity_ids.alloc(0x02);
        let guid = Guid::new(participant.guid.prefix, entity_id);
        let topic = topic.into();
        let writer = Arc::new(WriterEndpoint::new(guid, topic.clone(), type_name, keyed, qos));
        self.writers.insert(guid, &topic, writer);
        Ok(guid)
    }

    pub fn new_reader_guid(
        &self,
        participant: &Participant,
        topic: impl Into<String>,
        type_name: impl Into<String>,
        keyed: bool,
        qos: ReaderQos,
    ) -> Result<Guid> {
        qos.validate().map_err(Error::InvalidQos)?;
        let entity_id = participant.entity_ids.alloc(0x04);
        let guid = Guid::new(participant.guid.prefix, entity_id);
        let topic = topic.into();
        let reader = Arc::new(ReaderEndpoint::new(guid, topic.clone(), type_name, keyed, qos));
        self.readers.insert(guid, &topic, reader);
        Ok(guid)
    }

    /// spec §4.2 `delete_writer`: transition to `LINGERING` if unacked data
    /// remains, otherwise straight to `DeletingBuiltins`.
    pub fn delete_writer(&self, writer: &WriterEndpoint, has_unacked_data: bool) -> Result<()> {
        let mut state = writer
            .state
            .write()
            .map_err(|_| Error::PreconditionNotMet("writer state lock poisoned".into()))?;
        let next = if has_unacked_data {
            WriterState::Lingering
        } else {
            WriterState::DeletingBuiltins
        };
        if state.is_deleting() {
            return Err(Error::PreconditionNotMet("writer already deleting".into()));
        }
        if !state.can_transition_to(next) {
            return Err(Error::PreconditionNotMet(format!("illegal writer state transition {state:?} -> {next:?}")));
        }
        *state = next;
        Ok(())
    }

    /// Run the matching algorithm for one writer/reader candidate pair
    /// (spec §4.2 "Matching", steps 1-2; type lookup and security are
    /// external collaborators per spec §1 and are represented only as the
    /// `Matched` fall-through here).
    pub fn evaluate_match(&self, writer: &WriterEndpoint, reader: &ReaderEndpoint) -> MatchOutcome {
        // Step 1: topic check.
        if writer.topic != reader.topic || writer.keyed != reader.keyed {
            return MatchOutcome::TopicMismatch;
        }
        if !writer.guid.kind().is_writer_like() || !reader.guid.kind().is_reader_like() {
            return MatchOutcome::TopicMismatch;
        }

        // IGNORE_LOCAL suppression, evaluated before RxO per spec §4.2 step 2.
        if self.suppressed_by_ignore_local(writer, reader) {
            return MatchOutcome::SuppressedLocal;
        }

        // Step 2: QoS RxO compatibility.
        let result = check_rxo(&reader.qos, &writer.qos);
        if !result.is_compatible() {
            return MatchOutcome::IncompatibleQos(result.policies);
        }

        MatchOutcome::Matched
    }

    fn suppressed_by_ignore_local(&self, writer: &WriterEndpoint, reader: &ReaderEndpoint) -> bool {
        let same_participant = writer.guid.participant_guid() == reader.guid.participant_guid();
        let ignore_local = |policy: IgnoreLocal| match policy {
            IgnoreLocal::Off => false,
            IgnoreLocal::Participant => same_participant,
            IgnoreLocal::Process => true,
        };
        ignore_local(writer.qos.ignore_local) || ignore_local(reader.qos.ignore_local)
    }

    /// spec §4.2 step 5: successful match inserts match records into both
    /// sides' trees. Returns `true` if a heartbeat should be rescheduled
    /// within 1ms (reliable writer with unacked WHC contents).
    pub fn insert_connection(&self, writer: &WriterEndpoint, reader: &ReaderEndpoint) -> bool {
        let writer_seq = writer.seq.load(Ordering::Acquire);
        let reliable = reader.qos.reliability.is_reliable();
        {
            let mut matches = writer.matches.write().expect("writer match tree lock");
            matches.insert(writer_match::WriterMatchRecord::new(reader.guid, reliable), writer_seq);
        }
        {
            let mut matches = reader.matches.write().expect("reader match tree lock");
            matches.insert(reader_match::ReaderMatchRecord::new(writer.guid));
        }
        reliable && writer_seq > 0
    }

    pub fn remove_connection(&self, writer: &WriterEndpoint, reader_guid: &Guid) {
        let writer_seq = writer.seq.load(Ordering::Acquire);
        let mut matches = writer.matches.write().expect("writer match tree lock");
        matches.remove(reader_guid, writer_seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant() -> Participant {
        Participant::new([9; 12])
    }

    #[test]
    fn mismatched_topics_never_report_incompatible_qos() {
        let engine = MatchingEngine::new();
        let pp = participant();
        let w_guid = engine
            .new_writer_guid(&pp, "A", "Foo", true, WriterQos::default())
            .unwrap();
        let r_guid = engine
            .new_reader_guid(&pp, "B", "Foo", true, ReaderQos::default())
            .unwrap();
        let writer = engine.writers.get(&w_guid).unwrap();
        let reader = engine.readers.get(&r_guid).unwrap();
        assert_eq!(engine.evaluate_match(&writer, &reader), MatchOutcome::TopicMismatch);
    }

    #[test]
    fn incompatible_reliability_is_reported() {
        let engine = MatchingEngine::new();
        let pp = participant();
        let w_guid = engine
            .new_writer_guid(&pp, "A", "Foo", true, WriterQos::default())
            .unwrap();
        let mut rqos = ReaderQos::default();
        rqos.reliability.kind = crate::qos::reliability::ReliabilityKind::Reliable;
        let r_guid = engine.new_reader_guid(&pp, "A", "Foo", true, rqos).unwrap();
        let writer = engine.writers.get(&w_guid).unwrap();
        let reader = engine.readers.get(&r_guid).unwrap();
        match engine.evaluate_match(&writer, &reader) {
            MatchOutcome::IncompatibleQos(policies) => {
                assert_eq!(policies, vec![QosPolicyId::Reliability]);
            }
            other => panic!("expected incompatible qos, got {other:?}"),
        }
    }

    #[test]
    fn matching_pair_inserts_both_match_records() {
        let engine = MatchingEngine::new();
        let pp = participant();
        let w_guid = engine
            .new_writer_guid(&pp, "A", "Foo", true, WriterQos::default())
            .unwrap();
        let r_guid = engine.new_reader_guid(&pp, "A", "Foo", true, ReaderQos::default()).unwrap();
        let writer = engine.writers.get(&w_guid).unwrap();
        let reader = engine.readers.get(&r_guid).unwrap();
        assert_eq!(engine.evaluate_match(&writer, &reader), MatchOutcome::Matched);
        engine.insert_connection(&writer, &reader);
        assert_eq!(writer.matches.read().unwrap().len(), 1);
        assert_eq!(reader.matches.read().unwrap().len(), 1);
    }

    #[test]
    fn delete_writer_rejects_a_repeat_transition_into_the_same_state() {
        let engine = MatchingEngine::new();
        let pp = participant();
        let w_guid = engine.new_writer_guid(&pp, "A", "Foo", true, WriterQos::default()).unwrap();
        let writer = engine.writers.get(&w_guid).unwrap();

        engine.delete_writer(&writer, true).unwrap();
        assert_eq!(*writer.state.read().unwrap(), WriterState::Lingering);

        // Already LINGERING; asking for LINGERING again is not a one-way
        // transition and must be rejected, not silently re-applied.
        let err = engine.delete_writer(&writer, true).unwrap_err();
        assert!(matches!(err, Error::PreconditionNotMet(_)));
        assert_eq!(*writer.state.read().unwrap(), WriterState::Lingering);
    }

    #[test]
    fn delete_writer_rejects_once_already_deleting() {
        let engine = MatchingEngine::new();
        let pp = participant();
        let w_guid = engine.new_writer_guid(&pp, "A", "Foo", true, WriterQos::default()).unwrap();
        let writer = engine.writers.get(&w_guid).unwrap();

        engine.delete_writer(&writer, false).unwrap();
        assert_eq!(*writer.state.read().unwrap(), WriterState::DeletingBuiltins);
        let err = engine.delete_writer(&writer, false).unwrap_err();
        assert!(matches!(err, Error::PreconditionNotMet(_)));
    }
}
