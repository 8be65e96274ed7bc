// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Proxy writer / proxy reader — mirrors of remote endpoints (spec §3.5).

pub mod defrag;
pub mod proxy_reader;
pub mod proxy_writer;
pub mod reorder;

pub use proxy_reader::ProxyReader;
pub use proxy_writer::ProxyWriter;
