// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Key-instance map (spec §2 "TKMap").
//!
//! Shared mapping from a serialized key hash to a reference-counted
//! instance handle; assigns the 64-bit instance identifier threaded through
//! the WHC's per-instance index, the matching engine, and RHC alike.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Opaque 64-bit instance identifier (spec GLOSSARY "Instance").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(pub u64);

impl InstanceHandle {
    pub const NIL: InstanceHandle = InstanceHandle(0);
}

struct Entry {
    handle: InstanceHandle,
    refcount: AtomicU64,
    key_bytes: Vec<u8>,
}

/// A process-wide (per-topic, in practice) map from serialized key bytes to
/// a reference-counted instance handle.
///
/// Reference counting lets `unregister_instance` free the handle only once
/// every writer and reader that ever touched the instance has released it,
/// mirroring the entity index's own deferred-release discipline (spec
/// §3.2) at instance granularity.
pub struct TkMap {
    by_key_hash: DashMap<u64, Entry>,
    by_handle: DashMap<u64, u64>,
    next_handle: AtomicU64,
}

impl Default for TkMap {
    fn default() -> Self {
        Self {
            by_key_hash: DashMap::new(),
            by_handle: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl TkMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn hash_key(key_bytes: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        key_bytes.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up or allocate the instance handle for a serialized key,
    /// incrementing its reference count. Returns the handle to use in WHC
    /// and RHC per-instance indices.
    pub fn register(&self, key_bytes: &[u8]) -> InstanceHandle {
        let hash = Self::hash_key(key_bytes);
        let entry = self.by_key_hash.entry(hash).or_insert_with(|| {
            let handle = InstanceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
            self.by_handle.insert(handle.0, hash);
            Entry {
                handle,
                refcount: AtomicU64::new(0),
                key_bytes: key_bytes.to_vec(),
            }
        });
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        entry.handle
    }

    /// Release a reference obtained from [`register`](Self::register);
    /// drops the mapping once the last reference is gone.
    pub fn unregister(&self, key_bytes: &[u8]) {
        let hash = Self::hash_key(key_bytes);
        let mut handle_to_drop = None;
        if let Some(entry) = self.by_key_hash.get(&hash) {
            if entry.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
                handle_to_drop = Some(entry.handle.0);
            }
        }
        if let Some(handle) = handle_to_drop {
            self.by_key_hash.remove_if(&hash, |_, e| e.refcount.load(Ordering::Acquire) == 0);
            self.by_handle.remove(&handle);
        }
    }

    pub fn lookup(&self, key_bytes: &[u8]) -> Option<InstanceHandle> {
        self.by_key_hash
            .get(&Self::hash_key(key_bytes))
            .map(|e| e.handle)
    }

    /// Reverse lookup, grounded on the original's `ddsi_tkmap_find_by_id`:
    /// recover the serialized key bytes a given instance handle was
    /// registered for, e.g. to report which instance a DISPOSE/UNREGISTER
    /// notification is about without re-deserializing the sample.
    pub fn key_for_handle(&self, handle: InstanceHandle) -> Option<Vec<u8>> {
        let hash = *self.by_handle.get(&handle.0)?;
        self.by_key_hash.get(&hash).map(|e| e.key_bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.by_key_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key_hash.is_empty()
    }
}

/// A shared handle to a domain-wide [`TkMap`], the shape every writer and
/// reader actually holds.
pub type SharedTkMap = Arc<TkMap>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_yields_same_handle() {
        let map = TkMap::new();
        let a = map.register(b"key-1");
        let b = map.register(b"key-1");
        assert_eq!(a, b);
    }

    #[test]
    fn different_keys_yield_different_handles() {
        let map = TkMap::new();
        let a = map.register(b"key-1");
        let b = map.register(b"key-2");
        assert_ne!(a, b);
    }

    #[test]
    fn unregister_drops_entry_once_refcount_reaches_zero() {
        let map = TkMap::new();
        map.register(b"key-1");
        map.register(b"key-1");
        assert_eq!(map.len(), 1);
        map.unregister(b"key-1");
        assert_eq!(map.len(), 1);
        map.unregister(b"key-1");
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn key_for_handle_recovers_the_registered_key() {
        let map = TkMap::new();
        let handle = map.register(b"key-1");
        assert_eq!(map.key_for_handle(handle), Some(b"key-1".to_vec()));
    }

    #[test]
    fn key_for_handle_is_gone_once_unregistered() {
        let map = TkMap::new();
        let handle = map.register(b"key-1");
        map.unregister(b"key-1");
        assert_eq!(map.key_for_handle(handle), None);
    }
}
