// SPDX-License-Identifier: Apache-2.0 OR MIT

//! GUID-keyed entity index plus a topic-ordered enumeration index (spec §2
//! "Entity Index").
//!
//! Concurrent-read / single-writer-per-bucket per spec §5's "Shared-resource
//! policy", achieved here with `DashMap` rather than hand-rolled sharded
//! locks, the way the teacher crate's discovery layer already leans on
//! `dashmap` for its endpoint caches.

use std::sync::Arc;

use dashmap::DashMap;

use crate::guid::Guid;

/// A concurrent-read map from GUID to entity record, with a secondary
/// topic-name index for the matching engine's per-topic enumeration (spec
/// §2 Entity Index, §4.2 "Matching").
pub struct EntityIndex<T> {
    by_guid: DashMap<Guid, Arc<T>>,
    by_topic: DashMap<String, Vec<Guid>>,
}

impl<T> Default for EntityIndex<T> {
    fn default() -> Self {
        Self {
            by_guid: DashMap::new(),
            by_topic: DashMap::new(),
        }
    }
}

impl<T> EntityIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity under the domain-wide structural lock's scope (spec
    /// §5 "Global locks"); `DashMap`'s per-shard lock plays that role here.
    pub fn insert(&self, guid: Guid, topic: &str, entity: Arc<T>) {
        self.by_guid.insert(guid, entity);
        self.by_topic
            .entry(topic.to_string())
            .or_default()
            .push(guid);
    }

    pub fn get(&self, guid: &Guid) -> Option<Arc<T>> {
        self.by_guid.get(guid).map(|r| r.clone())
    }

    pub fn remove(&self, guid: &Guid, topic: &str) -> Option<Arc<T>> {
        let removed = self.by_guid.remove(guid).map(|(_, v)| v);
        if let Some(mut entry) = self.by_topic.get_mut(topic) {
            entry.retain(|g| g != guid);
        }
        removed
    }

    /// All GUIDs currently registered under a topic, in insertion order;
    /// used by the matching engine to enumerate candidates whenever a
    /// participant or QoS change requires a re-match pass (spec §4.2).
    pub fn topic_members(&self, topic: &str) -> Vec<Guid> {
        self.by_topic
            .get(topic)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_guid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_round_trips() {
        let idx: EntityIndex<u32> = EntityIndex::new();
        let guid = Guid::new([1; 12], [0, 0, 0, 2]);
        idx.insert(guid, "Square", Arc::new(42));
        assert_eq!(*idx.get(&guid).unwrap(), 42);
        assert_eq!(idx.topic_members("Square"), vec![guid]);
        assert_eq!(*idx.remove(&guid, "Square").unwrap(), 42);
        assert!(idx.get(&guid).is_none());
        assert!(idx.topic_members("Square").is_empty());
    }

    #[test]
    fn topic_members_only_lists_matching_topic() {
        let idx: EntityIndex<u32> = EntityIndex::new();
        let g1 = Guid::new([1; 12], [0, 0, 0, 2]);
        let g2 = Guid::new([2; 12], [0, 0, 0, 2]);
        idx.insert(g1, "Square", Arc::new(1));
        idx.insert(g2, "Circle", Arc::new(2));
        assert_eq!(idx.topic_members("Square"), vec![g1]);
        assert_eq!(idx.topic_members("Circle"), vec![g2]);
    }
}
