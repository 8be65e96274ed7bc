// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport plug-in contract (spec §6.2).
//!
//! The core does not open sockets, select interfaces, or implement
//! UDP/TCP/raw-Ethernet framing — those are the OUT-OF-SCOPE "transport
//! plug-in implementations" (spec §1). This module only names the contract
//! a host process's transport must satisfy, the way the teacher crate's
//! `transport::UdpTransport` and `transport::tcp::TcpTransport` both
//! implement one shape even though their I/O differs completely.

use std::sync::Arc;

use crate::error::Result;
use crate::wire::Locator;

/// Send-side flags a caller may pass to [`Transport::write`] (e.g.
/// "do not fragment", "high priority"). Left open for the transport to
/// interpret; the core does not inspect these itself.
pub type WriteFlags = u32;

/// An opaque transport-owned connection handle (spec §6.2:
/// "The core does not assume connection-orientation; UDP and raw-Ethernet
/// multiplex by locator, TCP exposes a listener via `create_listener`").
pub trait Connection: Send + Sync {
    /// The port this connection is bound to, if connection-oriented.
    fn port(&self) -> u16;
    /// The locator this connection sends/receives on.
    fn locator(&self) -> Locator;
}

/// External collaborator contract for a transport plug-in (spec §6.2).
///
/// `create_conn(qos)`, `free(conn)`, `write(conn, dst, iov, flags)`,
/// `read(conn, buf, len, out src_locator)`, `port(conn)`, `locator(conn)`.
pub trait Transport: Send + Sync {
    /// Create a connection suitable for the given reliability/multicast
    /// requirements. `qos_hint` is a transport-defined opaque blob (e.g.
    /// desired send-buffer size); the core passes through whatever its
    /// configuration layer decided.
    fn create_conn(&self, qos_hint: &TransportQosHint) -> Result<Arc<dyn Connection>>;

    /// TCP only: expose a listener locator peers can connect to.
    fn create_listener(&self, qos_hint: &TransportQosHint) -> Result<Arc<dyn Connection>> {
        self.create_conn(qos_hint)
    }

    /// Scatter-gather write to a destination locator.
    fn write(&self, conn: &dyn Connection, dst: &Locator, iov: &[&[u8]], flags: WriteFlags) -> Result<usize>;

    /// Read into `buf`, returning the byte count and the locator the
    /// datagram arrived from (multiplexing by locator is the transport's
    /// job, not the core's, per spec §6.2).
    fn read(&self, conn: &dyn Connection, buf: &mut [u8]) -> Result<(usize, Locator)>;
}

/// Transport-facing QoS hints the core derives from `DomainConfig` (spec
/// §6.3): receive buffer sizing feeds directly into the reliability
/// scheduler's `min_receive_buffer_size` retransmit-burst cap (spec §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportQosHint {
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub reliable: bool,
}

/// A deliberately minimal in-memory transport used only by this crate's own
/// tests to exercise the writer/reader paths end to end without a real
/// socket (spec §1 explicitly keeps real transports external). Delivers
/// synchronously to whatever the test wired up; not for production use.
pub mod loopback {
    use super::*;
    use std::sync::Mutex;

    pub struct LoopbackConnection {
        locator: Locator,
    }

    impl Connection for LoopbackConnection {
        fn port(&self) -> u16 {
            self.locator.port as u16
        }
        fn locator(&self) -> Locator {
            self.locator
        }
    }

    /// Captures every `write` call instead of delivering over a socket, so
    /// tests can assert on what the writer/reliability scheduler decided to
    /// transmit (spec §8 end-to-end scenarios).
    #[derive(Default)]
    pub struct LoopbackTransport {
        sent: Mutex<Vec<(Locator, Vec<u8>)>>,
        next_port: std::sync::atomic::AtomicU16,
    }

    impl LoopbackTransport {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                next_port: std::sync::atomic::AtomicU16::new(7400),
            }
        }

        pub fn sent(&self) -> Vec<(Locator, Vec<u8>)> {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn clear(&self) {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    impl Transport for LoopbackTransport {
        fn create_conn(&self, _qos_hint: &TransportQosHint) -> Result<Arc<dyn Connection>> {
            let port = self.next_port.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(Arc::new(LoopbackConnection {
                locator: Locator {
                    kind: Locator::KIND_UDPV4,
                    port: port as u32,
                    address: [0; 16],
                },
            }))
        }

        fn write(&self, _conn: &dyn Connection, dst: &Locator, iov: &[&[u8]], _flags: WriteFlags) -> Result<usize> {
            let mut bytes = Vec::new();
            for chunk in iov {
                bytes.extend_from_slice(chunk);
            }
            let len = bytes.len();
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).push((*dst, bytes));
            Ok(len)
        }

        fn read(&self, _conn: &dyn Connection, _buf: &mut [u8]) -> Result<(usize, Locator)> {
            Ok((0, Locator::invalid()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackTransport;
    use super::*;

    #[test]
    fn loopback_transport_captures_writes() {
        let t = LoopbackTransport::new();
        let conn = t.create_conn(&TransportQosHint::default()).unwrap();
        let dst = Locator {
            kind: Locator::KIND_UDPV4,
            port: 7410,
            address: [0; 16],
        };
        t.write(conn.as_ref(), &dst, &[b"hello", b" world"], 0).unwrap();
        let sent = t.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, b"hello world");
    }
}
