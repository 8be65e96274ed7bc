// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RELIABILITY QoS policy (spec §4.2 step 2).
//!
//! # QoS Compatibility (Request vs Offered)
//!
//! A reader requesting `Reliable` cannot match a writer offering
//! `BestEffort`; every other combination is compatible.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityKind {
    #[default]
    BestEffort,
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reliability {
    pub kind: ReliabilityKind,
    /// Max time a reliable writer may block before giving up on an ack.
    pub max_blocking_time: Duration,
}

impl Default for Reliability {
    fn default() -> Self {
        Self {
            kind: ReliabilityKind::BestEffort,
            max_blocking_time: Duration::from_millis(100),
        }
    }
}

impl Reliability {
    pub fn reliable(max_blocking_time: Duration) -> Self {
        Self {
            kind: ReliabilityKind::Reliable,
            max_blocking_time,
        }
    }

    pub fn best_effort() -> Self {
        Self::default()
    }

    pub fn is_reliable(&self) -> bool {
        self.kind == ReliabilityKind::Reliable
    }

    /// `self` is the reader's requested policy, `offered` is the writer's.
    pub fn is_compatible_with(&self, offered: &Reliability) -> bool {
        match (self.kind, offered.kind) {
            (ReliabilityKind::Reliable, ReliabilityKind::BestEffort) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_reader_rejects_best_effort_writer() {
        let reader = Reliability::reliable(Duration::from_secs(1));
        let writer = Reliability::best_effort();
        assert!(!reader.is_compatible_with(&writer));
    }

    #[test]
    fn best_effort_reader_accepts_anything() {
        let reader = Reliability::best_effort();
        assert!(reader.is_compatible_with(&Reliability::best_effort()));
        assert!(reader.is_compatible_with(&Reliability::reliable(Duration::from_secs(1))));
    }
}
