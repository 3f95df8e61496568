//! gale-ws — WebSocket data plane for the gale serving runtime.
//!
//! End-to-end flow: [`WsListener`] accepts a TCP connection, runs the
//! HTTP/1.1 upgrade handshake (preserving any bytes read past it), wraps the
//! socket in a batch [`Transport`], and produces a [`WsConnection`]. The
//! connection's receive driver pulls transport batches through the RFC 6455
//! [`FrameCodec`], answers control frames inline, reassembles fragmented
//! messages, and delivers each complete message to the inbox (blocking pull
//! API) and to the registered [`Handler`] as a zero-copy pool buffer.
//!
//! # Echo server sketch
//!
//! ```no_run
//! use std::sync::Arc;
//! use gale_core::BufferPool;
//! use gale_ws::{ConnectionConfig, WsListener};
//!
//! let pool = BufferPool::default();
//! let listener = WsListener::bind("0.0.0.0:9001", pool, ConnectionConfig::default()).unwrap();
//! loop {
//!     let conn = listener.accept().unwrap();
//!     let echo = conn.clone();
//!     conn.set_handler(Arc::new(move |payload: gale_core::Buffer| {
//!         echo.send_binary(payload.as_slice())
//!     }));
//!     conn.start().unwrap();
//! }
//! ```

mod client;
mod codec;
mod connection;
mod handshake;
mod listener;
mod transport;

pub use client::connect;
pub use codec::{
    apply_mask, close_code, Frame, FrameCodec, Message, MessageAssembler, Opcode, ProtocolError,
    Role, MAX_FRAME_PAYLOAD,
};
pub use connection::{
    ConnectionConfig, ConnectionState, ConnectionStats, Handler, WsConnection,
};
pub use handshake::{
    accept_key, client_request, generate_key, read_accept_response, read_upgrade_request,
    write_accept_response, UpgradeRequest, MAX_HEADER_BYTES, WS_GUID,
};
pub use listener::WsListener;
pub use transport::{wrap_stream, BufferedTransport, TcpTransport, Transport, TransportFeatures};

#[cfg(feature = "dpdk")]
pub use transport::dpdk;
