//! Client-side connector.
//!
//! Dials a server, performs the upgrade handshake, and produces a
//! client-mode [`WsConnection`] (outgoing frames are masked with fresh
//! random keys). Bytes the server sends on the heels of its 101 response
//! are preserved into the receive path, mirroring the listener side.

use crate::codec::Role;
use crate::connection::{ConnectionConfig, WsConnection};
use crate::handshake::{client_request, generate_key, read_accept_response};
use crate::transport::{wrap_stream, BufferedTransport, Transport};
use gale_core::{BufferPool, Result};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

/// Connects to `addr` and upgrades to a WebSocket on `path`.
pub fn connect(
    addr: impl ToSocketAddrs,
    path: &str,
    pool: BufferPool,
    config: ConnectionConfig,
) -> Result<WsConnection> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;

    let host = stream
        .peer_addr()
        .map_or_else(|_| "localhost".to_owned(), |peer| peer.to_string());
    let key = generate_key();
    stream.write_all(client_request(&host, path, &key).as_bytes())?;
    stream.flush()?;

    let trailing = read_accept_response(&mut stream, &key)?;
    tracing::debug!(%host, path, "upgrade accepted");

    let node = config.node;
    let tcp: Arc<dyn Transport> = wrap_stream(stream, pool.clone(), node);
    let transport: Arc<dyn Transport> = if trailing.is_empty() {
        tcp
    } else {
        Arc::new(BufferedTransport::new(tcp, trailing, pool.clone(), node))
    };

    WsConnection::new(transport, pool, Some(path.to_owned()), config, Role::Client)
}
