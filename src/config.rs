// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Configuration inputs consumed by the core (spec §6.3).
//!
//! This is the in-memory contract only. Parsing it from XML/YAML/CLI flags
//! is the OUT-OF-SCOPE "configuration parsing" collaborator (spec §1); the
//! core only needs the validated struct, the way the teacher crate's
//! `config.rs` separates "Level 1 (Static constants)" from "Level 2 (Dynamic
//! runtime config)".

use std::time::Duration;

/// How many unicast sockets a participant opens per the RTPS discovery model.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SocketMode {
    SingleUnicast,
    ManyUnicast,
    NoUnicast,
}

/// Domain-wide configuration (spec §6.3).
#[derive(Clone, Debug)]
pub struct DomainConfig {
    pub domain_id: u32,
    pub participant_index: Option<u32>,
    pub max_auto_participant_index: u32,
    pub max_participants: usize,
    pub socket_mode: SocketMode,
    pub allow_multicast: bool,
    pub fragment_size: usize,
    pub lease_duration: Duration,
    pub prune_deleted_participant_delay: Duration,
    pub reliability: ReliabilityConfig,
    pub whc: WhcConfig,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            domain_id: 0,
            participant_index: None,
            max_auto_participant_index: 119,
            max_participants: 120,
            socket_mode: SocketMode::SingleUnicast,
            allow_multicast: true,
            fragment_size: 1344,
            lease_duration: Duration::from_secs(10),
            prune_deleted_participant_delay: Duration::from_secs(5),
            reliability: ReliabilityConfig::default(),
            whc: WhcConfig::default(),
        }
    }
}

/// Reliability / heartbeat-scheduler tunables (spec §4.3, §6.3).
#[derive(Copy, Clone, Debug)]
pub struct ReliabilityConfig {
    pub const_hb_intv_min: Duration,
    pub const_hb_intv_max: Duration,
    pub const_hb_intv_sched: Duration,
    pub const_hb_intv_sched_min: Duration,
    pub const_hb_intv_sched_max: Duration,
    pub preemptive_ack_delay: Duration,
    pub nack_delay: Duration,
    pub max_queued_rexmit_bytes: usize,
    pub max_rexmit_burst_size: usize,
    pub init_transmit_extra_pct: u32,
    pub max_blocking_time: Duration,
    /// Percentage (0..=100) of jitter applied to the scheduled heartbeat
    /// interval so that many writers on one host don't phase-lock their
    /// heartbeats (SPEC_FULL §B "Heartbeat jitter"). 0 disables jitter.
    pub heartbeat_jitter_pct: u8,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            const_hb_intv_min: Duration::from_millis(20),
            const_hb_intv_max: Duration::from_secs(8),
            const_hb_intv_sched: Duration::from_millis(100),
            const_hb_intv_sched_min: Duration::from_millis(5),
            const_hb_intv_sched_max: Duration::from_secs(8),
            preemptive_ack_delay: Duration::from_millis(10),
            nack_delay: Duration::from_millis(100),
            max_queued_rexmit_bytes: 512 * 1024,
            max_rexmit_burst_size: 64 * 1024,
            init_transmit_extra_pct: 50,
            max_blocking_time: Duration::from_secs(1),
            heartbeat_jitter_pct: 10,
        }
    }
}

/// Writer-history-cache watermarks (spec §4.3 "Throttling", §6.3).
#[derive(Copy, Clone, Debug)]
pub struct WhcConfig {
    pub whc_lowwater_mark: usize,
    pub whc_highwater_mark: usize,
    pub whc_init_highwater_mark: usize,
    pub whc_adaptive: bool,
}

impl Default for WhcConfig {
    fn default() -> Self {
        Self {
            whc_lowwater_mark: 1_000_000,
            whc_highwater_mark: 5_000_000,
            whc_init_highwater_mark: 1_000_000,
            whc_adaptive: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_watermarks() {
        let cfg = DomainConfig::default();
        assert!(cfg.whc.whc_lowwater_mark < cfg.whc.whc_highwater_mark);
        assert!(cfg.reliability.const_hb_intv_sched_min < cfg.reliability.const_hb_intv_sched_max);
    }
}
