// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-writer heartbeat scheduling (spec §3.7, §4.3 "Heartbeat interval",
//! "Must send a heartbeat?", "Heartbeat-ack-required decision").
//!
//! Unlike the teacher's fixed-period `heartbeat_scheduler.rs`, the
//! interval here is adaptive: it doubles on quiescence and halves under
//! watermark pressure, per spec §4.3.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::ReliabilityConfig;

fn instant_to_nanos(base: Instant, t: Instant) -> u64 {
    t.saturating_duration_since(base).as_nanos() as u64
}

/// What a heartbeat scheduling decision asks the caller to do (spec §4.3
/// "Heartbeat-ack-required decision": "0 suppresses it").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDecision {
    Suppress,
    Scheduled,
    SendNow,
}

impl HeartbeatDecision {
    fn from_code(code: u8) -> Self {
        match code {
            2 => Self::SendNow,
            1 => Self::Scheduled,
            _ => Self::Suppress,
        }
    }
}

/// Per-writer heartbeat control block (spec §3.7): "monotonic timestamps
/// of the last data write, the last heartbeat, and the last
/// ack-requesting heartbeat; the scheduled next-heartbeat time; a count
/// of heartbeats since the last write; the identifier of the last
/// transmitted packet."
pub struct HeartbeatState {
    epoch: Instant,
    last_write: AtomicU64,
    last_hb: AtomicU64,
    last_ack_requesting_hb: AtomicU64,
    heartbeats_since_write: AtomicU32,
    count: AtomicU32,
    last_transmit_packet_id: AtomicU64,
}

impl HeartbeatState {
    pub fn new() -> Self {
        let epoch = Instant::now();
        Self {
            epoch,
            last_write: AtomicU64::new(0),
            last_hb: AtomicU64::new(0),
            last_ack_requesting_hb: AtomicU64::new(0),
            heartbeats_since_write: AtomicU32::new(0),
            count: AtomicU32::new(1),
            last_transmit_packet_id: AtomicU64::new(0),
        }
    }

    fn now_nanos(&self) -> u64 {
        instant_to_nanos(self.epoch, Instant::now())
    }

    /// Record a data write, resetting the since-write heartbeat counter.
    pub fn note_write(&self) {
        self.last_write.store(self.now_nanos(), Ordering::Release);
        self.heartbeats_since_write.store(0, Ordering::Release);
    }

    pub fn note_heartbeat_sent(&self, ack_requesting: bool) {
        let now = self.now_nanos();
        self.last_hb.store(now, Ordering::Release);
        self.heartbeats_since_write.fetch_add(1, Ordering::AcqRel);
        if ack_requesting {
            self.last_ack_requesting_hb.store(now, Ordering::Release);
        }
    }

    pub fn next_count(&self) -> u32 {
        self.count.fetch_add(1, Ordering::Relaxed)
    }

    /// Note the enqueuing thread's current transmit packet id; used to
    /// detect "the packet boundary has been crossed" for piggyback
    /// decisions (spec §4.3 "Piggyback on data").
    pub fn note_transmit_packet_id(&self, packet_id: u64) -> bool {
        let prev = self.last_transmit_packet_id.swap(packet_id, Ordering::AcqRel);
        prev != packet_id
    }

    /// The adaptive interval (spec §4.3 "Heartbeat interval").
    ///
    /// Base `const_hb_intv_sched`; doubles per extra heartbeat past the
    /// second with no intervening write, up to `const_hb_intv_sched_max`;
    /// halved once past 50%-of-high-water unacked bytes, halved again
    /// past 75%; halved once more while actively throttled; floored at
    /// `const_hb_intv_sched_min`.
    pub fn interval(
        &self,
        cfg: &ReliabilityConfig,
        unacked_bytes: usize,
        whc_low: usize,
        whc_high: usize,
        is_throttled: bool,
    ) -> Duration {
        let mut interval = cfg.const_hb_intv_sched;
        let since_write = self.heartbeats_since_write.load(Ordering::Acquire);
        if since_write > 2 {
            let doublings = since_write - 2;
            interval = interval.saturating_mul(1u32.checked_shl(doublings).unwrap_or(u32::MAX));
            interval = interval.min(cfg.const_hb_intv_sched_max);
        }

        let span = whc_high.saturating_sub(whc_low);
        let threshold_50 = whc_low + span / 2;
        let threshold_75 = whc_low + (span * 3) / 4;
        if unacked_bytes >= threshold_75 {
            interval /= 4;
        } else if unacked_bytes >= threshold_50 {
            interval /= 2;
        }
        if is_throttled {
            interval /= 2;
        }

        let interval = Self::apply_jitter(interval, cfg.heartbeat_jitter_pct);
        interval.max(cfg.const_hb_intv_sched_min)
    }

    /// Perturb `period` by up to `jitter_pct` percent so that many writers
    /// on one host do not phase-lock their heartbeats (teacher's
    /// `HeartbeatTx::apply_jitter`, folded into the interval computation
    /// per SPEC_FULL §B rather than kept as a separate deadline helper).
    /// Additive only: does not change the doubling/halving decision rule
    /// of spec §4.3, only the concrete duration it yields.
    fn apply_jitter(period: Duration, jitter_pct: u8) -> Duration {
        if jitter_pct == 0 {
            return period;
        }

        let now_ns = Instant::now().elapsed().as_nanos();
        let jitter_seed = u32::try_from(now_ns % 200).unwrap_or(0);
        let jitter_factor = i32::try_from(jitter_seed).unwrap_or(0) - 100; // -100..=100

        let base_ms = i128::try_from(period.as_millis()).unwrap_or(i128::MAX);
        let jitter_ms = base_ms
            .saturating_mul(i128::from(jitter_pct))
            .saturating_mul(i128::from(jitter_factor))
            / 10_000;

        let adjusted_ms = base_ms.saturating_add(jitter_ms).max(1);
        let millis_u128 = u128::try_from(adjusted_ms).unwrap_or(u128::from(u64::MAX));
        let clamped_ms = millis_u128.min(u128::from(u64::MAX));

        Duration::from_millis(clamped_ms as u64)
    }

    /// "Must send a heartbeat?" (spec §4.3): `now >= last_hb + interval`.
    pub fn must_send(&self, interval: Duration) -> bool {
        let now = self.now_nanos();
        let last_hb = self.last_hb.load(Ordering::Acquire);
        now >= last_hb.saturating_add(interval.as_nanos() as u64)
    }

    /// Heartbeat-ack-required decision (spec §4.3): `2` forces the packet
    /// out immediately, `1` schedules it, `0` suppresses it.
    pub fn ack_required_decision(
        &self,
        cfg: &ReliabilityConfig,
        interval: Duration,
        unacked_bytes: usize,
        whc_low: usize,
        whc_high: usize,
    ) -> HeartbeatDecision {
        let now = self.now_nanos();
        let last_write = self.last_write.load(Ordering::Acquire);
        let last_hb = self.last_hb.load(Ordering::Acquire);
        let last_ack_hb = self.last_ack_requesting_hb.load(Ordering::Acquire);
        let interval_nanos = interval.as_nanos() as u64;

        let piggyback_due = now.saturating_sub(last_write) > interval_nanos;
        let event_due = now.saturating_sub(last_hb) > interval_nanos;

        let span = whc_high.saturating_sub(whc_low);
        let pressure_threshold = whc_low + span / 2;
        let pressure_due = unacked_bytes >= pressure_threshold
            && now.saturating_sub(last_ack_hb) > cfg.const_hb_intv_min.as_nanos() as u64;

        let code = if piggyback_due || event_due {
            2
        } else if pressure_due {
            1
        } else {
            0
        };
        HeartbeatDecision::from_code(code)
    }
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}
