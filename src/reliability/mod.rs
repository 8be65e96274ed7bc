// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reliability & Heartbeat Scheduler (spec §4.3): heartbeat timing and
//! piggyback/ack-required decisions, ACKNACK-driven retransmission, and
//! writer throttling against the WHC's high watermark.

pub mod acknack;
pub mod heartbeat;
pub mod throttle;
