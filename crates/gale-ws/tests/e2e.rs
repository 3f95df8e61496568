//! End-to-end scenarios over loopback TCP: echo, fragmentation with
//! interleaved control frames, oversized-frame rejection, close handshake,
//! handshake-trailing bytes, and inbox backpressure.

use gale_core::{Buffer, BufferPool, Error};
use gale_ws::{
    client_request, close_code, ConnectionConfig, Frame, FrameCodec, Opcode, Role, WsConnection,
    WsListener,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Minimal RFC 6455 client used to drive the server under test.
struct TestClient {
    stream: TcpStream,
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl TestClient {
    fn connect(addr: SocketAddr, path: &str) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
            .write_all(client_request("test", path, "AQIDBAUGBwgJCgsMDQ4PEA==").as_bytes())
            .unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed during handshake");
            response.extend_from_slice(&chunk[..n]);
        }
        assert!(response.starts_with(b"HTTP/1.1 101"));

        Self {
            stream,
            codec: FrameCodec::new(Role::Client),
            buf: Vec::new(),
        }
    }

    fn send(&mut self, frame: &Frame) {
        let bytes = self.codec.encode(frame, true).unwrap();
        self.stream.write_all(&bytes).unwrap();
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Reads the next frame; `None` when the server closed the stream.
    fn read_frame(&mut self) -> Option<Frame> {
        let mut chunk = [0u8; 65536];
        loop {
            if let Some((frame, consumed)) = self.codec.decode(&self.buf).unwrap() {
                self.buf.drain(..consumed);
                return Some(frame);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) => panic!("client read failed: {err}"),
            }
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Binds a listener and accepts a single connection on a helper thread.
fn serve_one(
    pool: BufferPool,
    config: ConnectionConfig,
) -> (SocketAddr, mpsc::Receiver<WsConnection>, Arc<WsListener>) {
    init_tracing();
    let listener = Arc::new(WsListener::bind("127.0.0.1:0", pool, config).unwrap());
    let addr = listener.local_addr();
    let (tx, rx) = mpsc::channel();
    {
        let listener = Arc::clone(&listener);
        thread::spawn(move || {
            if let Ok(conn) = listener.accept() {
                let _ = tx.send(conn);
            }
        });
    }
    (addr, rx, listener)
}

fn accept(rx: &mpsc::Receiver<WsConnection>) -> WsConnection {
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn test_echo_round_trip() {
    let (addr, rx, _listener) = serve_one(BufferPool::new(1), ConnectionConfig::default());
    let mut client = TestClient::connect(addr, "/echo");

    let conn = accept(&rx);
    let echo = conn.clone();
    conn.set_handler(Arc::new(move |payload: Buffer| {
        echo.send_text(std::str::from_utf8(payload.as_slice()).unwrap())
    }));
    conn.start().unwrap();

    client.send(&Frame::text("hello"));

    let reply = client.read_frame().unwrap();
    assert!(reply.fin);
    assert_eq!(reply.opcode, Opcode::Text);
    assert_eq!(reply.payload, b"hello");
}

#[test]
fn test_fragmented_message_single_dispatch() {
    const MIB: usize = 1024 * 1024;

    let (addr, rx, _listener) = serve_one(BufferPool::new(1), ConnectionConfig::default());
    let mut client = TestClient::connect(addr, "/frag");

    let conn = accept(&rx);
    let (tx, payload_rx) = mpsc::channel();
    let invocations = Arc::new(AtomicU64::new(0));
    {
        let invocations = Arc::clone(&invocations);
        conn.set_handler(Arc::new(move |payload: Buffer| {
            invocations.fetch_add(1, Ordering::SeqCst);
            tx.send(payload.as_slice().to_vec()).unwrap();
            Ok(())
        }));
    }
    conn.start().unwrap();

    // 3 MiB binary message in three 1 MiB frames.
    client.send(&Frame {
        fin: false,
        opcode: Opcode::Binary,
        payload: vec![0xAA; MIB],
    });
    client.send(&Frame {
        fin: false,
        opcode: Opcode::Continuation,
        payload: vec![0xBB; MIB],
    });
    client.send(&Frame {
        fin: true,
        opcode: Opcode::Continuation,
        payload: vec![0xCC; MIB],
    });

    let payload = payload_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(payload.len(), 3 * MIB);
    assert_eq!(payload[0], 0xAA);
    assert_eq!(payload[MIB], 0xBB);
    assert_eq!(payload[3 * MIB - 1], 0xCC);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn test_ping_answered_during_fragmented_message() {
    let (addr, rx, _listener) = serve_one(BufferPool::new(1), ConnectionConfig::default());
    let mut client = TestClient::connect(addr, "/interleave");

    let conn = accept(&rx);
    let (tx, dispatched) = mpsc::channel();
    conn.set_handler(Arc::new(move |payload: Buffer| {
        tx.send(payload.len()).unwrap();
        Ok(())
    }));
    conn.start().unwrap();

    client.send(&Frame {
        fin: false,
        opcode: Opcode::Binary,
        payload: vec![1; 1024],
    });
    client.send(&Frame::ping(b"ka".to_vec()));

    // The pong arrives while the fragmented message is still incomplete,
    // so it necessarily precedes the handler dispatch.
    let pong = client.read_frame().unwrap();
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload, b"ka");
    assert!(dispatched.try_recv().is_err());

    client.send(&Frame {
        fin: true,
        opcode: Opcode::Continuation,
        payload: vec![2; 1024],
    });
    assert_eq!(
        dispatched.recv_timeout(Duration::from_secs(5)).unwrap(),
        2048
    );
}

#[test]
fn test_oversized_frame_closes_with_1009() {
    let (addr, rx, _listener) = serve_one(BufferPool::new(1), ConnectionConfig::default());
    let mut client = TestClient::connect(addr, "/oversize");

    let conn = accept(&rx);
    let (tx, handler_calls) = mpsc::channel();
    conn.set_handler(Arc::new(move |payload: Buffer| {
        tx.send(payload.len()).unwrap();
        Ok(())
    }));
    conn.start().unwrap();

    // Single masked frame declaring a 2 MiB payload. The declaration alone
    // must kill the connection.
    let mut raw = vec![0x82, 0x80 | 127];
    raw.extend_from_slice(&(2u64 * 1024 * 1024).to_be_bytes());
    raw.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]); // mask key
    client.send_raw(&raw);

    let close = client.read_frame().unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_status(), Some(close_code::MESSAGE_TOO_BIG));

    assert!(conn.wait_closed(Duration::from_secs(1)));
    assert!(handler_calls.try_recv().is_err());
}

#[test]
fn test_close_handshake_echoes_code_and_reason() {
    let (addr, rx, _listener) = serve_one(BufferPool::new(1), ConnectionConfig::default());
    let mut client = TestClient::connect(addr, "/close");

    let conn = accept(&rx);
    conn.start().unwrap();

    // A pending recv must surface the shutdown.
    let pending_recv = {
        let conn = conn.clone();
        thread::spawn(move || conn.recv())
    };

    client.send(&Frame::close(close_code::NORMAL, "bye"));

    let echoed = client.read_frame().unwrap();
    assert_eq!(echoed.opcode, Opcode::Close);
    assert_eq!(echoed.close_status(), Some(close_code::NORMAL));
    assert_eq!(echoed.close_reason(), b"bye");

    assert!(conn.wait_closed(Duration::from_secs(1)));
    assert!(matches!(
        pending_recv.join().unwrap(),
        Err(Error::TransportClosed)
    ));
}

#[test]
fn test_handshake_trailing_bytes_reach_receive_path() {
    let pool = BufferPool::new(1);
    let listener = Arc::new(WsListener::bind("127.0.0.1:0", pool, ConnectionConfig::default()).unwrap());
    let addr = listener.local_addr();
    let (tx, rx) = mpsc::channel();
    {
        let listener = Arc::clone(&listener);
        thread::spawn(move || {
            let _ = tx.send(listener.accept().unwrap());
        });
    }

    // Handshake and the first frame in a single write.
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let codec = FrameCodec::new(Role::Client);
    let mut bytes = client_request("test", "/early", "AQIDBAUGBwgJCgsMDQ4PEA==").into_bytes();
    bytes.extend_from_slice(&codec.encode(&Frame::text("early bird"), true).unwrap());
    stream.write_all(&bytes).unwrap();

    let conn = accept(&rx);
    conn.start().unwrap();

    let message = conn.recv().unwrap();
    assert_eq!(message.as_text(), Some("early bird"));
}

#[test]
fn test_client_connector_end_to_end() {
    let (addr, rx, _listener) = serve_one(BufferPool::new(1), ConnectionConfig::default());

    let client = gale_ws::connect(addr, "/client", BufferPool::new(1), ConnectionConfig::default())
        .unwrap();
    client.start().unwrap();

    let server = accept(&rx);
    assert_eq!(server.path(), Some("/client"));
    let echo = server.clone();
    server.set_handler(Arc::new(move |payload: Buffer| {
        echo.send_binary(payload.as_slice())
    }));
    server.start().unwrap();

    client.send_binary(&[9, 8, 7]).unwrap();
    let reply = client.recv().unwrap();
    assert_eq!(reply.payload, vec![9, 8, 7]);

    client.close().unwrap();
    assert!(server.wait_closed(Duration::from_secs(2)));
}

#[test]
fn test_backpressure_bounds_resident_buffers() {
    const FRAMES: usize = 10_000;
    const FRAME_SIZE: usize = 8 * 1024;
    const CHANNEL: usize = 64;

    let pool = BufferPool::new(1);
    let (addr, rx, _listener) = serve_one(
        pool.clone(),
        ConnectionConfig {
            channel_size: CHANNEL,
            ..ConnectionConfig::default()
        },
    );

    let sender = thread::spawn(move || {
        let mut client = TestClient::connect(addr, "/pressure");
        for _ in 0..FRAMES {
            client.send(&Frame::binary(vec![0x5A; FRAME_SIZE]));
        }
        client
    });

    let conn = accept(&rx);
    conn.start().unwrap();

    // No consumer yet: the inbox fills and the receive driver stalls.
    let deadline = Instant::now() + Duration::from_secs(10);
    while conn.pending() < CHANNEL && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(conn.pending(), CHANNEL);

    // Resident pool buffers stay bounded by channel size + 2 while the
    // driver is backpressured (inbox messages are owned copies; the pool
    // only holds the in-flight receive buffer).
    thread::sleep(Duration::from_millis(100));
    assert!(conn.pending() <= CHANNEL);
    assert!(
        pool.stats().in_use <= (CHANNEL + 2) as u64,
        "resident buffers {} exceed bound",
        pool.stats().in_use
    );

    // Drain everything; the sender unblocks as the window reopens.
    for i in 0..FRAMES {
        let message = conn.recv().unwrap();
        assert_eq!(message.payload.len(), FRAME_SIZE, "frame {i}");
    }
    assert_eq!(conn.pending(), 0);

    drop(sender.join().unwrap());
    conn.close().unwrap();
}
