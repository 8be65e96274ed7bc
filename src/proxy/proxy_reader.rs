// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Proxy reader: the local mirror of a remote `DataReader` (spec §3.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::entity::Vclock;
use crate::guid::Guid;
use crate::lease::Lease;
use crate::wire::Locator;

/// Source-specific multicast addressing a writer favors when the matched
/// reader both enables and prefers SSM (spec §3.4 "when SSM is enabled and
/// favored, SSM source and group locators").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsmAddress {
    pub source: Locator,
    pub group: Locator,
}

/// The local mirror of a remote reader (spec §3.5): "Mirrors of remote
/// endpoints." A proxy reader is lighter than a proxy writer — it is the
/// writer side's view of one matched remote reader, carrying just enough
/// state to drive destination selection (spec §4.3) and liveliness.
pub struct ProxyReader {
    pub guid: Guid,
    pub unicast_locators: Vec<Locator>,
    pub multicast_locators: Vec<Locator>,
    pub ssm: Option<SsmAddress>,
    alive: AtomicBool,
    alive_vclock: Vclock,
    lease: RwLock<Option<Lease>>,
}

impl ProxyReader {
    pub fn new(guid: Guid, unicast_locators: Vec<Locator>, multicast_locators: Vec<Locator>) -> Self {
        Self {
            guid,
            unicast_locators,
            multicast_locators,
            ssm: None,
            alive: AtomicBool::new(true),
            alive_vclock: Vclock::new(),
            lease: RwLock::new(None),
        }
    }

    pub fn with_ssm(mut self, ssm: SsmAddress) -> Self {
        self.ssm = Some(ssm);
        self
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn alive_vclock(&self) -> u64 {
        self.alive_vclock.load()
    }

    pub fn set_alive(&self, alive: bool) -> u64 {
        self.alive.store(alive, Ordering::Release);
        self.alive_vclock.advance()
    }

    pub fn set_lease(&self, lease: Option<Lease>) {
        *self.lease.write().expect("proxy reader lease lock") = lease;
    }

    pub fn renew_lease(&self) {
        let mut guard = self.lease.write().expect("proxy reader lease lock");
        if let Some(lease) = guard.as_ref() {
            *guard = Some(lease.renewed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u8) -> Guid {
        Guid::new([n; 12], [0, 0, 0, 0xc7])
    }

    #[test]
    fn fresh_proxy_reader_is_alive() {
        let pr = ProxyReader::new(guid(1), vec![], vec![]);
        assert!(pr.is_alive());
        assert_eq!(pr.alive_vclock(), 0);
    }

    #[test]
    fn ssm_address_carries_through_builder() {
        let source = Locator {
            kind: Locator::KIND_UDPV4,
            port: 7401,
            address: [1; 16],
        };
        let group = Locator {
            kind: Locator::KIND_UDPV4,
            port: 7401,
            address: [239; 16],
        };
        let pr = ProxyReader::new(guid(1), vec![], vec![]).with_ssm(SsmAddress { source, group });
        assert_eq!(pr.ssm.unwrap().group, group);
    }
}
