//! Batch transport abstraction over byte streams.
//!
//! [`Transport`] moves batches of byte slices in both directions: `send`
//! writes every slice in order (scatter/gather under the hood), `recv`
//! returns pool-backed buffers. The TCP backend uses std's vectored I/O,
//! which maps to `writev` on POSIX and `WSASend` batching on Windows.
//! [`BufferedTransport`] replays handshake-trailing bytes ahead of the
//! socket. The optional `dpdk` backend degrades to TCP when no device can
//! be bound.

use gale_core::{buffer_from, Buffer, BufferPool, Error, Result};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Capability bits advertised by a transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportFeatures {
    /// Receive buffers share pool memory with the application.
    pub zero_copy: bool,
    /// Send/receive operate on batches of slices.
    pub batch: bool,
    /// Receive buffers are placed on a caller-chosen NUMA node.
    pub numa_aware: bool,
    /// Transport-level TLS termination.
    pub tls: bool,
    /// Operating systems this backend supports.
    pub os: &'static [&'static str],
}

/// Bidirectional batch byte transport.
pub trait Transport: Send + Sync {
    /// Sends every slice, in order. Returns the first error encountered.
    fn send(&self, batch: &[&[u8]]) -> Result<()>;

    /// Receives at least one slice when data is available. Blocks until
    /// data arrives or the stream closes.
    fn recv(&self) -> Result<Vec<Buffer>>;

    /// Shuts the transport down. Idempotent.
    fn close(&self) -> Result<()>;

    /// Advertised capabilities.
    fn features(&self) -> TransportFeatures;
}

/// Default receive buffer request size.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Blocking TCP backend with vectored writes and pool-backed reads.
pub struct TcpTransport {
    stream: TcpStream,
    pool: BufferPool,
    node: i32,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, pool: BufferPool, node: i32) -> Self {
        Self {
            stream,
            pool,
            node,
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, batch: &[&[u8]]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }

        let mut remaining: Vec<&[u8]> = batch.iter().copied().filter(|s| !s.is_empty()).collect();
        while !remaining.is_empty() {
            let slices: Vec<IoSlice<'_>> = remaining.iter().map(|s| IoSlice::new(s)).collect();
            let written = match (&self.stream).write_vectored(&slices) {
                Ok(0) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(Error::TransportClosed);
                }
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };

            // Drop fully written slices, trim the first partial one.
            let mut left = written;
            remaining.retain_mut(|slice| {
                if left == 0 {
                    return true;
                }
                if left >= slice.len() {
                    left -= slice.len();
                    false
                } else {
                    *slice = &slice[left..];
                    left = 0;
                    true
                }
            });
        }
        Ok(())
    }

    fn recv(&self) -> Result<Vec<Buffer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }

        // Scatter read across two pooled buffers; a burst larger than one
        // buffer lands in the second without another syscall.
        let mut first = self.pool.get(RECV_BUFFER_SIZE, self.node);
        let mut second = self.pool.get(RECV_BUFFER_SIZE, self.node);
        let first_capacity = first.len();

        let n = {
            let mut iov = [
                IoSliceMut::new(first.as_mut_slice()),
                IoSliceMut::new(second.as_mut_slice()),
            ];
            loop {
                match (&self.stream).read_vectored(&mut iov) {
                    Ok(0) => {
                        self.closed.store(true, Ordering::Release);
                        return Err(Error::TransportClosed);
                    }
                    Ok(n) => break n,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        // Non-blocking readiness without data: empty batch.
                        return Ok(Vec::new());
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        if n <= first_capacity {
            first.truncate(n);
            Ok(vec![first])
        } else {
            second.truncate(n - first_capacity);
            Ok(vec![first, second])
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Peer may already be gone; shutdown errors are not actionable.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn features(&self) -> TransportFeatures {
        TransportFeatures {
            zero_copy: true,
            batch: true,
            numa_aware: true,
            tls: false,
            os: &["linux", "windows", "macos"],
        }
    }
}

/// Transport adapter that replays bytes read past the handshake before
/// delegating to the inner transport.
pub struct BufferedTransport {
    inner: Arc<dyn Transport>,
    pending: Mutex<Vec<u8>>,
    pool: BufferPool,
    node: i32,
}

impl BufferedTransport {
    pub fn new(inner: Arc<dyn Transport>, pending: Vec<u8>, pool: BufferPool, node: i32) -> Self {
        Self {
            inner,
            pending: Mutex::new(pending),
            pool,
            node,
        }
    }
}

impl Transport for BufferedTransport {
    fn send(&self, batch: &[&[u8]]) -> Result<()> {
        self.inner.send(batch)
    }

    fn recv(&self) -> Result<Vec<Buffer>> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if pending.is_empty() {
            self.inner.recv()
        } else {
            Ok(vec![buffer_from(&self.pool, &pending, self.node)?])
        }
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn features(&self) -> TransportFeatures {
        self.inner.features()
    }
}

/// Poll-mode userspace NIC backend stub.
///
/// The probe fails unless a driver is bound, and callers degrade to the TCP
/// backend; see [`wrap_stream`].
#[cfg(feature = "dpdk")]
pub mod dpdk {
    use super::{Buffer, Error, Result, Transport, TransportFeatures};

    pub struct DpdkTransport {
        _private: (),
    }

    impl DpdkTransport {
        /// Probes for a bound poll-mode driver.
        pub fn probe() -> Result<Self> {
            Err(Error::NotSupported("no poll-mode driver bound"))
        }
    }

    impl Transport for DpdkTransport {
        fn send(&self, _batch: &[&[u8]]) -> Result<()> {
            Err(Error::NotSupported("poll-mode backend not initialized"))
        }

        fn recv(&self) -> Result<Vec<Buffer>> {
            Err(Error::NotSupported("poll-mode backend not initialized"))
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        fn features(&self) -> TransportFeatures {
            TransportFeatures {
                zero_copy: true,
                batch: true,
                numa_aware: true,
                tls: false,
                os: &["linux"],
            }
        }
    }
}

/// Wraps an accepted TCP stream in the best available backend.
pub fn wrap_stream(stream: TcpStream, pool: BufferPool, node: i32) -> Arc<dyn Transport> {
    #[cfg(feature = "dpdk")]
    match dpdk::DpdkTransport::probe() {
        Ok(transport) => return Arc::new(transport),
        Err(err) => {
            tracing::debug!(%err, "poll-mode probe failed, using tcp backend");
        }
    }

    Arc::new(TcpTransport::new(stream, pool, node))
}
