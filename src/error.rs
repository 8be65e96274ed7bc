// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy for the core engine.
//!
//! Mirrors the DDS-mandated error categories (see spec §7) plus the handful
//! of operational variants the writer/reader/WHC paths need to report
//! without resorting to stringly-typed errors.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the matching engine, WHC, and reliability scheduler.
#[derive(Debug)]
pub enum Error {
    /// A GUID, handle, or argument did not resolve to a known entity.
    BadParameter(String),
    /// The entity is in the wrong lifecycle state for the requested operation
    /// (e.g. a writer already in `DELETING`, a participant created twice).
    PreconditionNotMet(String),
    /// Allocation failed, a participant/instance/resource cap was hit, or a
    /// network endpoint could not be created.
    OutOfResources(String),
    /// A blocking write exceeded `max_blocking_time`.
    Timeout,
    /// Authentication or access control rejected the operation.
    NotAllowedBySecurity(String),
    /// QoS policies requested are internally inconsistent (e.g. KEEP_LAST(0)).
    InvalidQos(String),
    /// The operation would have blocked and the caller asked not to.
    WouldBlock,
    /// Underlying I/O failure from a transport plug-in.
    IoError(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadParameter(msg) => write!(f, "bad parameter: {msg}"),
            Error::PreconditionNotMet(msg) => write!(f, "precondition not met: {msg}"),
            Error::OutOfResources(msg) => write!(f, "out of resources: {msg}"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::NotAllowedBySecurity(msg) => write!(f, "not allowed by security: {msg}"),
            Error::InvalidQos(msg) => write!(f, "invalid qos: {msg}"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::IoError(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}
