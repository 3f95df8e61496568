//! TCP listener producing handshaken WebSocket connections.

use crate::connection::{ConnectionConfig, WsConnection};
use crate::codec::Role;
use crate::handshake::{read_upgrade_request, write_accept_response};
use crate::transport::{wrap_stream, BufferedTransport, Transport};
use gale_core::{BufferPool, Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Accept loop endpoint: TCP accept → upgrade handshake → connection.
pub struct WsListener {
    tcp: TcpListener,
    local_addr: SocketAddr,
    pool: BufferPool,
    config: ConnectionConfig,
    closed: AtomicBool,
}

impl WsListener {
    /// Binds to `addr` and prepares to accept upgrades.
    pub fn bind(
        addr: impl ToSocketAddrs,
        pool: BufferPool,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let tcp = TcpListener::bind(addr)?;
        let local_addr = tcp.local_addr()?;
        tracing::debug!(%local_addr, "listener bound");
        Ok(Self {
            tcp,
            local_addr,
            pool,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one connection: TCP accept, Nagle off, buffered handshake
    /// read, 101 response, transport wrap preserving trailing bytes.
    ///
    /// A handshake failure closes the socket and surfaces the error; the
    /// listener stays usable. After [`close`](Self::close), pending and
    /// future accepts fail with `ListenerClosed`.
    pub fn accept(&self) -> Result<WsConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ListenerClosed);
        }

        let (mut stream, peer) = match self.tcp.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::ListenerClosed);
                }
                return Err(err.into());
            }
        };
        // A dummy wake-up connection from close() lands here.
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ListenerClosed);
        }

        stream.set_nodelay(true)?;

        let request = match read_upgrade_request(&mut stream) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(%peer, %err, "handshake rejected");
                // Dropping the stream closes the socket.
                return Err(err);
            }
        };
        write_accept_response(&mut stream, &request.key)?;
        tracing::debug!(%peer, path = %request.path, "connection upgraded");

        let node = self.config.node;
        let tcp: Arc<dyn Transport> = wrap_stream(stream, self.pool.clone(), node);
        let transport: Arc<dyn Transport> = if request.trailing.is_empty() {
            tcp
        } else {
            // The handshake read may already hold frame bytes.
            Arc::new(BufferedTransport::new(
                tcp,
                request.trailing,
                self.pool.clone(),
                node,
            ))
        };

        WsConnection::new(
            transport,
            self.pool.clone(),
            Some(request.path),
            self.config.clone(),
            Role::Server,
        )
    }

    /// Closes the listener; pending accepts return `ListenerClosed`.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Unblock a pending accept with a throwaway connection.
            let mut wake_addr = self.local_addr;
            if wake_addr.ip().is_unspecified() {
                wake_addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            let _ = TcpStream::connect(wake_addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::client_request;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    fn listener() -> WsListener {
        WsListener::bind("127.0.0.1:0", BufferPool::new(1), ConnectionConfig::default()).unwrap()
    }

    fn client_upgrade(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(client_request("test", "/chat", "AQIDBAUGBwgJCgsMDQ4PEA==").as_bytes())
            .unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed during handshake");
            response.extend_from_slice(&chunk[..n]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101"), "{response}");
        stream
    }

    #[test]
    fn test_accept_performs_handshake() {
        let listener = listener();
        let addr = listener.local_addr();

        let client = thread::spawn(move || client_upgrade(addr));
        let conn = listener.accept().unwrap();
        client.join().unwrap();

        assert_eq!(conn.path(), Some("/chat"));
    }

    #[test]
    fn test_accept_rejects_bad_handshake() {
        let listener = listener();
        let addr = listener.local_addr();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
            // The server closes the socket on rejection.
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });

        assert!(listener.accept().is_err());
        client.join().unwrap();
    }

    #[test]
    fn test_close_unblocks_pending_accept() {
        let listener = Arc::new(listener());

        let acceptor = {
            let listener = Arc::clone(&listener);
            thread::spawn(move || listener.accept())
        };
        thread::sleep(Duration::from_millis(50));

        listener.close().unwrap();
        let result = acceptor.join().unwrap();
        assert!(matches!(result, Err(Error::ListenerClosed)));

        // Closed for good.
        assert!(matches!(listener.accept(), Err(Error::ListenerClosed)));
        listener.close().unwrap();
    }
}
