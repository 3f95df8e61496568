//! Per-connection state machine: receive driver, send path, inbox, handler
//! dispatch, control-frame handling, close semantics.
//!
//! A connection owns exactly one receive driver thread (started with
//! [`WsConnection::start`]) and serializes the send path with an
//! encoder-level lock, so there is one send in flight at a time. Complete
//! messages are delivered both to the inbox (blocking pull API) and to the
//! registered handler (push API, zero-copy pool buffer); a configuration
//! toggle switches to exclusive handler delivery. When the inbox is full the
//! driver blocks, which backpressures the peer through TCP.
//!
//! State machine: `Open → Closing → Closed`. A received Close frame is
//! echoed once with the same code/reason; local close sends its own Close
//! frame. Either path ends with the transport shut down, `done` signalled,
//! and every public operation failing with `TransportClosed`.

use crate::codec::{
    close_code, Frame, FrameCodec, Message, MessageAssembler, Opcode, ProtocolError, Role,
};
use crate::transport::{Transport, TransportFeatures};
use bytes::{Buf, BytesMut};
use gale_core::{Buffer, BufferPool, Control, Error, Result, Ring, Scheduler, TimerHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Application callback receiving complete messages as pool buffers.
///
/// The buffer is released when dropped; implementations own it for exactly
/// that one release.
pub trait Handler: Send + Sync {
    fn handle(&self, payload: Buffer) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(Buffer) -> Result<()> + Send + Sync,
{
    fn handle(&self, payload: Buffer) -> Result<()> {
        self(payload)
    }
}

/// Connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Inbox (and outbox) depth; rounded up to a power of two.
    pub channel_size: usize,
    /// Strict decode mode (see [`FrameCodec::strict`]).
    pub strict: bool,
    /// NUMA node hint for receive and handler buffers; `-1` means auto.
    pub node: i32,
    /// When set, messages go only to the handler while one is registered,
    /// instead of to both the handler and the inbox.
    pub exclusive_handler: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_size: 64,
            strict: false,
            node: -1,
            exclusive_handler: false,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Per-connection traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub handler_errors: u64,
}

/// Inbox wait plumbing: one mutex, two directions.
struct InboxSignal {
    lock: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl InboxSignal {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn wait_not_empty(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .not_empty
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }

    fn wait_not_full(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .not_full
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }

    fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn notify_not_empty(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.not_empty.notify_one();
    }

    fn notify_not_full(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.not_full.notify_one();
    }
}

const WAIT_SLICE: Duration = Duration::from_millis(10);

struct ConnInner {
    transport: Arc<dyn Transport>,
    pool: BufferPool,
    path: Option<String>,
    config: ConnectionConfig,
    codec: FrameCodec,
    role: Role,

    inbox: Ring<Message>,
    outbox: Ring<Frame>,
    signal: InboxSignal,
    recv_lock: Mutex<()>,

    handler: RwLock<Option<Arc<dyn Handler>>>,
    send_lock: Mutex<()>,

    state: AtomicU8,
    loop_running: AtomicBool,
    close_echoed: AtomicBool,
    done: gale_core::DoneSignal,

    epoch: Instant,
    activity_nanos: AtomicU64,
    last_pong_nanos: AtomicU64,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    handler_errors: AtomicU64,
}

impl ConnInner {
    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn mark_activity(&self) {
        self.activity_nanos
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Encodes and sends one frame; the lock serializes the whole encode +
    /// write so frames never interleave on the wire.
    fn send_frame_internal(&self, frame: &Frame) -> Result<()> {
        let mask = self.role == Role::Client;
        let bytes = self.codec.encode(frame, mask)?;

        let _serialized = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.transport.send(&[&bytes])?;
        self.bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Final transition: close transport, signal done, wake every waiter.
    fn teardown(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev != STATE_CLOSED {
            let _ = self.transport.close();
            self.done.signal();
        }
        self.signal.notify_all();
    }
}

/// A WebSocket connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<ConnInner>,
}

impl WsConnection {
    /// Builds a connection over an established (post-handshake) transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: BufferPool,
        path: Option<String>,
        config: ConnectionConfig,
        role: Role,
    ) -> Result<Self> {
        let depth = config.channel_size.max(1).next_power_of_two();
        let codec = FrameCodec::new(role).strict(config.strict);

        Ok(Self {
            inner: Arc::new(ConnInner {
                transport,
                pool,
                path,
                config,
                codec,
                role,
                inbox: Ring::new(depth)?,
                outbox: Ring::new(depth)?,
                signal: InboxSignal::new(),
                recv_lock: Mutex::new(()),
                handler: RwLock::new(None),
                send_lock: Mutex::new(()),
                state: AtomicU8::new(STATE_OPEN),
                loop_running: AtomicBool::new(false),
                close_echoed: AtomicBool::new(false),
                done: gale_core::DoneSignal::new(),
                epoch: Instant::now(),
                activity_nanos: AtomicU64::new(0),
                last_pong_nanos: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
            }),
        })
    }

    /// Request path this connection was accepted on, when it came through
    /// the listener.
    pub fn path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.state() {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Registers the push handler. Replaces any previous one.
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.inner.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.inner.handler.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Spawns the receive driver. There is exactly one; a second call fails.
    pub fn start(&self) -> Result<()> {
        if self.inner.state() != STATE_OPEN {
            return Err(Error::TransportClosed);
        }
        if self.inner.loop_running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidArgument(
                "receive driver already running".into(),
            ));
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("gale-ws-recv".into())
            .spawn(move || {
                receive_loop(&inner);
                inner.loop_running.store(false, Ordering::Release);
            });
        if let Err(err) = spawned {
            self.inner.loop_running.store(false, Ordering::Release);
            return Err(err.into());
        }
        Ok(())
    }

    /// Blocking receive from the inbox.
    ///
    /// Fails with `TransportClosed` once the connection is closed. Intended
    /// for a single consumer; concurrent callers are serialized.
    pub fn recv(&self) -> Result<Message> {
        loop {
            if self.inner.state() == STATE_CLOSED {
                return Err(Error::TransportClosed);
            }
            {
                let _single = self.inner.recv_lock.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(message) = self.inner.inbox.try_dequeue() {
                    self.inner.signal.notify_not_full();
                    return Ok(message);
                }
            }
            self.inner.signal.wait_not_empty(WAIT_SLICE);
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<Option<Message>> {
        if self.inner.state() == STATE_CLOSED {
            return Err(Error::TransportClosed);
        }
        let _single = self.inner.recv_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.inner.inbox.try_dequeue() {
            Some(message) => {
                self.inner.signal.notify_not_full();
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Number of messages waiting in the inbox.
    pub fn pending(&self) -> usize {
        self.inner.inbox.len()
    }

    /// Sends a frame synchronously. Serialized per connection; the mask bit
    /// is set iff this is a client-mode connection.
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.inner.state() != STATE_OPEN {
            return Err(Error::TransportClosed);
        }
        self.inner.send_frame_internal(frame)
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(&Frame::text(text.as_bytes().to_vec()))
    }

    pub fn send_binary(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(&Frame::binary(payload.to_vec()))
    }

    pub fn send_ping(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(&Frame::ping(payload.to_vec()))
    }

    /// Queues a frame on the outbox without touching the wire; returns
    /// false when the outbox is full. Producers that want decoupling pair
    /// this with [`flush_queued`](Self::flush_queued).
    pub fn queue_frame(&self, frame: Frame) -> bool {
        self.inner.outbox.try_enqueue(frame).is_ok()
    }

    /// Drains the outbox onto the wire; returns the number of frames sent.
    pub fn flush_queued(&self) -> Result<usize> {
        let mut sent = 0;
        while let Some(frame) = self.inner.outbox.try_dequeue() {
            self.send_frame(&frame)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Closes with code 1000. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.close_with(close_code::NORMAL, "")
    }

    /// Closes with an explicit code and reason. Idempotent; the Close frame
    /// is sent best-effort on the first call only.
    pub fn close_with(&self, code: u16, reason: &str) -> Result<()> {
        let initiated = self
            .inner
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        // At most one Close frame ever leaves this connection, whether it
        // originates locally or echoes the peer's.
        if initiated && !self.inner.close_echoed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.send_frame_internal(&Frame::close(code, reason));
        }
        self.inner.teardown();
        Ok(())
    }

    /// Blocks until the connection reaches `Closed` or the timeout elapses.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.inner.done.wait_timeout(timeout)
    }

    /// Completion signal fired on close.
    pub fn done(&self) -> &gale_core::DoneSignal {
        &self.inner.done
    }

    /// Traffic counters snapshot.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.inner.frames_sent.load(Ordering::Relaxed),
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
        }
    }

    /// Time since the last received data or pong.
    pub fn last_activity(&self) -> Duration {
        let at = self.inner.activity_nanos.load(Ordering::Relaxed);
        self.inner.epoch.elapsed().saturating_sub(Duration::from_nanos(at))
    }

    /// Time since the last pong, `None` before the first one.
    pub fn last_pong(&self) -> Option<Duration> {
        let at = self.inner.last_pong_nanos.load(Ordering::Relaxed);
        if at == 0 {
            None
        } else {
            Some(self.inner.epoch.elapsed().saturating_sub(Duration::from_nanos(at)))
        }
    }

    /// Capabilities of the underlying transport.
    pub fn transport_features(&self) -> TransportFeatures {
        self.inner.transport.features()
    }

    /// Schedules periodic pings until the connection closes.
    pub fn start_heartbeat(&self, scheduler: &Arc<Scheduler>, interval: Duration) -> TimerHandle {
        schedule_heartbeat(
            Arc::downgrade(&self.inner),
            Arc::clone(scheduler),
            interval,
        )
    }

    /// Publishes this connection's counters as debug probes.
    pub fn register_probes(&self, prefix: &str, control: &dyn Control) {
        let probes: [(&str, fn(&ConnInner) -> u64); 5] = [
            ("bytes_sent", |c| c.bytes_sent.load(Ordering::Relaxed)),
            ("bytes_received", |c| c.bytes_received.load(Ordering::Relaxed)),
            ("frames_sent", |c| c.frames_sent.load(Ordering::Relaxed)),
            ("frames_received", |c| c.frames_received.load(Ordering::Relaxed)),
            ("handler_errors", |c| c.handler_errors.load(Ordering::Relaxed)),
        ];
        for (name, read) in probes {
            let inner = Arc::downgrade(&self.inner);
            control.register_debug_probe(
                &format!("{prefix}.{name}"),
                Box::new(move || inner.upgrade().map_or(0, |c| read(&c))),
            );
        }
    }
}

fn schedule_heartbeat(
    inner: Weak<ConnInner>,
    scheduler: Arc<Scheduler>,
    interval: Duration,
) -> TimerHandle {
    let sched = Arc::clone(&scheduler);
    scheduler.schedule(interval, move || {
        let Some(conn) = inner.upgrade() else { return };
        if conn.state() != STATE_OPEN {
            return;
        }
        if conn.send_frame_internal(&Frame::ping(Vec::new())).is_err() {
            return;
        }
        let _next = schedule_heartbeat(inner.clone(), Arc::clone(&sched), interval);
    })
}

/// Receive driver: transport batches → assembly buffer → codec → control
/// handling and message delivery.
fn receive_loop(inner: &Arc<ConnInner>) {
    let mut assembly = BytesMut::with_capacity(8192);
    let mut assembler = MessageAssembler::new();

    'outer: while inner.state() != STATE_CLOSED {
        let batch = match inner.transport.recv() {
            Ok(batch) => batch,
            Err(err) => {
                tracing::debug!(%err, "receive loop terminating");
                break;
            }
        };

        for buffer in &batch {
            inner
                .bytes_received
                .fetch_add(buffer.len() as u64, Ordering::Relaxed);
            assembly.extend_from_slice(buffer.as_slice());
        }
        drop(batch);
        inner.mark_activity();

        loop {
            match inner.codec.decode(&assembly) {
                Ok(None) => break,
                Ok(Some((frame, consumed))) => {
                    assembly.advance(consumed);
                    inner.frames_received.fetch_add(1, Ordering::Relaxed);

                    if frame.opcode.is_control() {
                        if !handle_control(inner, frame) {
                            break 'outer;
                        }
                    } else {
                        match assembler.push(frame) {
                            Ok(Some(message)) => {
                                if !deliver(inner, message) {
                                    break 'outer;
                                }
                            }
                            Ok(None) => {}
                            Err(violation) => {
                                abort_with(inner, &violation);
                                break 'outer;
                            }
                        }
                    }
                }
                Err(violation) => {
                    abort_with(inner, &violation);
                    break 'outer;
                }
            }
        }
    }

    inner.teardown();
}

/// Handles Ping/Pong/Close inline. Returns false when the connection must
/// tear down.
fn handle_control(inner: &Arc<ConnInner>, frame: Frame) -> bool {
    match frame.opcode {
        Opcode::Ping => {
            // Pong echoes the ping payload, ahead of any in-progress
            // fragmented message.
            inner
                .send_frame_internal(&Frame::pong(frame.payload))
                .is_ok()
        }
        Opcode::Pong => {
            inner
                .last_pong_nanos
                .store(inner.epoch.elapsed().as_nanos() as u64, Ordering::Relaxed);
            inner.mark_activity();
            true
        }
        Opcode::Close => {
            tracing::debug!(code = ?frame.close_status(), "peer sent close");
            if !inner.close_echoed.swap(true, Ordering::AcqRel) {
                let _ = inner.send_frame_internal(&Frame::close_raw(frame.payload));
            }
            let _ = inner.state.compare_exchange(
                STATE_OPEN,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            false
        }
        _ => false,
    }
}

/// Sends the violation's close code best-effort before teardown.
fn abort_with(inner: &Arc<ConnInner>, violation: &ProtocolError) {
    tracing::debug!(%violation, "protocol violation, closing");
    if !inner.close_echoed.swap(true, Ordering::AcqRel) {
        let _ = inner.send_frame_internal(&Frame::close(
            violation.close_code(),
            &violation.to_string(),
        ));
    }
}

/// Delivers a complete message to the inbox and handler. Returns false when
/// the connection closed while backpressured.
fn deliver(inner: &Arc<ConnInner>, message: Message) -> bool {
    let handler = inner
        .handler
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let to_inbox = !(inner.config.exclusive_handler && handler.is_some());
    if to_inbox {
        let mut message = message.clone();
        loop {
            match inner.inbox.try_enqueue(message) {
                Ok(()) => {
                    inner.signal.notify_not_empty();
                    break;
                }
                Err(back) => {
                    message = back;
                    if inner.state() == STATE_CLOSED {
                        return false;
                    }
                    // Inbox full: hold the driver, which backpressures the
                    // peer through the socket.
                    inner.signal.wait_not_full(WAIT_SLICE);
                }
            }
        }
    }

    if let Some(handler) = handler {
        let mut buffer = inner.pool.get(message.payload.len(), inner.config.node);
        buffer.as_mut_slice()[..message.payload.len()].copy_from_slice(&message.payload);
        buffer.truncate(message.payload.len());

        if let Err(err) = handler.handle(buffer) {
            inner.handler_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%err, "handler failed");
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        (accepted, connect.join().unwrap())
    }

    fn server_conn(stream: TcpStream) -> WsConnection {
        let pool = BufferPool::new(1);
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(stream, pool.clone(), 0));
        WsConnection::new(
            transport,
            pool,
            Some("/test".into()),
            ConnectionConfig::default(),
            Role::Server,
        )
        .unwrap()
    }

    fn client_codec() -> FrameCodec {
        FrameCodec::new(Role::Client)
    }

    /// Reads the next frame, keeping leftover bytes in `buf` for later
    /// calls.
    fn read_one_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Frame {
        let codec = client_codec();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((frame, consumed)) = codec.decode(buf).unwrap() {
                buf.drain(..consumed);
                return frame;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed before a frame arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_inbox_receives_message() {
        let (server, mut client) = tcp_pair();
        let conn = server_conn(server);
        conn.start().unwrap();

        let bytes = client_codec().encode(&Frame::text("hello"), true).unwrap();
        client.write_all(&bytes).unwrap();

        let message = conn.recv().unwrap();
        assert_eq!(message.as_text(), Some("hello"));
        assert_eq!(conn.stats().frames_received, 1);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (server, mut client) = tcp_pair();
        let conn = server_conn(server);
        conn.start().unwrap();

        let bytes = client_codec()
            .encode(&Frame::ping(b"ka".to_vec()), true)
            .unwrap();
        client.write_all(&bytes).unwrap();

        let mut wire = Vec::new();
        let pong = read_one_frame(&mut client, &mut wire);
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"ka");
    }

    #[test]
    fn test_handler_gets_pool_buffer() {
        let (server, mut client) = tcp_pair();
        let conn = server_conn(server);

        let (tx, rx) = std::sync::mpsc::channel();
        conn.set_handler(Arc::new(move |payload: Buffer| {
            tx.send(payload.as_slice().to_vec()).unwrap();
            Ok(())
        }));
        conn.start().unwrap();

        let bytes = client_codec()
            .encode(&Frame::binary(vec![1, 2, 3]), true)
            .unwrap();
        client.write_all(&bytes).unwrap();

        let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(payload, vec![1, 2, 3]);

        // Both-delivery semantics: the inbox got a copy too.
        let message = conn.recv().unwrap();
        assert_eq!(message.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_exclusive_handler_skips_inbox() {
        let (server, mut client) = tcp_pair();
        let pool = BufferPool::new(1);
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(server, pool.clone(), 0));
        let conn = WsConnection::new(
            transport,
            pool,
            None,
            ConnectionConfig {
                exclusive_handler: true,
                ..ConnectionConfig::default()
            },
            Role::Server,
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        conn.set_handler(Arc::new(move |payload: Buffer| {
            tx.send(payload.len()).unwrap();
            Ok(())
        }));
        conn.start().unwrap();

        let bytes = client_codec().encode(&Frame::text("only-push"), true).unwrap();
        client.write_all(&bytes).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
        assert!(conn.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_close_is_idempotent_and_poisons_api() {
        let (server, _client) = tcp_pair();
        let conn = server_conn(server);

        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.done().is_done());

        assert!(matches!(conn.send_text("x"), Err(Error::TransportClosed)));
        assert!(matches!(conn.recv(), Err(Error::TransportClosed)));
        assert!(matches!(conn.start(), Err(Error::TransportClosed)));
    }

    #[test]
    fn test_peer_close_echoed_and_done() {
        let (server, mut client) = tcp_pair();
        let conn = server_conn(server);
        conn.start().unwrap();

        let bytes = client_codec()
            .encode(&Frame::close(close_code::NORMAL, "bye"), true)
            .unwrap();
        client.write_all(&bytes).unwrap();

        let mut wire = Vec::new();
        let echoed = read_one_frame(&mut client, &mut wire);
        assert_eq!(echoed.opcode, Opcode::Close);
        assert_eq!(echoed.close_status(), Some(close_code::NORMAL));
        assert_eq!(echoed.close_reason(), b"bye");

        assert!(conn.wait_closed(Duration::from_secs(1)));
        assert!(matches!(conn.recv(), Err(Error::TransportClosed)));
    }

    #[test]
    fn test_outbox_queue_and_flush() {
        let (server, mut client) = tcp_pair();
        let conn = server_conn(server);

        assert!(conn.queue_frame(Frame::text("a")));
        assert!(conn.queue_frame(Frame::text("b")));
        assert_eq!(conn.flush_queued().unwrap(), 2);

        let mut wire = Vec::new();
        let first = read_one_frame(&mut client, &mut wire);
        assert_eq!(first.payload, b"a");
        let second = read_one_frame(&mut client, &mut wire);
        assert_eq!(second.payload, b"b");
    }

    #[test]
    fn test_second_start_rejected() {
        let (server, _client) = tcp_pair();
        let conn = server_conn(server);
        conn.start().unwrap();
        assert!(matches!(conn.start(), Err(Error::InvalidArgument(_))));
    }
}
