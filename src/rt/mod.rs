// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Low-level runtime primitives shared by the WHC and the receive path.

pub mod slabpool;

pub use slabpool::{SlabHandle, SlabPool};
