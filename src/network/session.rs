//! Session handling
//!
//! A session exclusively owns one connection:
//! - a read task reassembles frames and delivers packets in arrival order
//! - a write task drains a FIFO queue so frames never interleave
//! - whichever side fails first closes both, and the disconnect is reported once

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant as Deadline;
use tracing::{debug, info, warn};

use super::ListenerConfig;
use crate::cancel::CancellationToken;
use crate::protocol::{encode_frame, Disconnect, FrameDecoder, Origin, RawPacket, TypedPacket};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,

    /// The send queue is full because the peer is not reading fast enough
    #[error("Send queue full")]
    Overloaded,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection
    PeerClosed,
    /// Reading from the socket failed
    ReadFailed(String),
    /// Writing to the socket failed
    WriteFailed(String),
    /// Too many consecutive undecodable frames
    ProtocolViolation(usize),
    /// Closed on request of the server
    Kicked(String),
    /// The server is shutting down
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "connection closed by peer"),
            DisconnectReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            DisconnectReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            DisconnectReason::ProtocolViolation(n) => {
                write!(f, "{} consecutive malformed frames", n)
            }
            DisconnectReason::Kicked(reason) => write!(f, "kicked: {}", reason),
            DisconnectReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Events emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A complete, decoded packet, delivered in arrival order
    PacketReceived { origin: Origin, packet: RawPacket },
    /// The session has ended. Emitted exactly once.
    Disconnected {
        origin: Origin,
        reason: DisconnectReason,
        /// Frames that were queued but never written
        unsent: usize,
    },
}

/// Tuning knobs for a single session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_len: usize,
    /// Consecutive decode errors tolerated before disconnecting; 0 = unlimited
    pub max_decode_errors: usize,
    pub send_queue: usize,
    /// How long queued frames may take to flush once the session closes
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_len: crate::protocol::DEFAULT_MAX_FRAME_LEN,
            max_decode_errors: 8,
            send_queue: 256,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&ListenerConfig> for SessionConfig {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            max_frame_len: config.max_frame_len,
            max_decode_errors: config.max_decode_errors,
            send_queue: config.send_queue,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// State shared between a session's tasks and its handles
#[derive(Debug)]
struct Shared {
    origin: Origin,
    peer_addr: SocketAddr,
    created: Instant,
    /// Milliseconds since `created` at the last received frame
    last_activity_ms: AtomicU64,
    connected: AtomicBool,
    close: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
}

impl Shared {
    /// Record why the session is closing (first reason wins) and stop both tasks.
    fn close(&self, reason: DisconnectReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.close.cancel();
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }
}

/// A handle for sending packets to a session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn origin(&self) -> Origin {
        self.shared.origin
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Queue a packet for sending, waiting for room in the queue.
    /// Frames are written in queue order.
    pub async fn send(&self, packet: &RawPacket) -> SessionResult<()> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }

        self.sender
            .send(encode_frame(packet))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queue a packet without waiting. Fails with `Overloaded` when the
    /// queue is full.
    pub fn try_send(&self, packet: &RawPacket) -> SessionResult<()> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }

        self.sender.try_send(encode_frame(packet)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Overloaded,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Queue a disconnect notice if there is room, then close the session.
    pub fn kick(&self, reason: &str) {
        let notice = Disconnect {
            reason: reason.to_string(),
        }
        .to_raw(Origin::SERVER);

        if let Err(e) = self.try_send(&notice) {
            debug!("Kick notice for {} not queued: {}", self.origin(), e);
        }
        self.shared.close(DisconnectReason::Kicked(reason.to_string()));
    }

    /// Close without a notice, e.g. after the peer said goodbye.
    /// Frames already queued are still flushed.
    pub fn close(&self) {
        self.shared.close(DisconnectReason::PeerClosed);
    }

    /// Check if the session is still active. A closing session no longer
    /// accepts frames even while it drains its queue.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && !self.shared.close.is_cancelled()
    }

    /// Get time since the last received frame
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.shared.last_activity_ms.load(Ordering::Relaxed));
        self.shared.created.elapsed().saturating_sub(last)
    }
}

/// Represents one accepted connection before its tasks are started
pub struct Session<S> {
    stream: S,
    config: SessionConfig,
    outbound: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a session and the handle used to send to it.
    pub fn new(
        stream: S,
        origin: Origin,
        peer_addr: SocketAddr,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let (sender, outbound) = mpsc::channel(config.send_queue.max(1));
        let shared = Arc::new(Shared {
            origin,
            peer_addr,
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            close: CancellationToken::new(),
            reason: Mutex::new(None),
        });

        let handle = SessionHandle {
            sender,
            shared: shared.clone(),
        };
        let session = Self {
            stream,
            config,
            outbound,
            shared,
        };
        (session, handle)
    }

    /// Run the session until it disconnects.
    ///
    /// Packets and the final disconnect are reported on `events`. Cancelling
    /// `shutdown` closes the session after flushing what is already queued.
    pub async fn run(self, events: mpsc::Sender<SessionEvent>, shutdown: CancellationToken) {
        let Session {
            stream,
            config,
            outbound,
            shared,
        } = self;
        let origin = shared.origin;
        let (reader, writer) = tokio::io::split(stream);

        info!("Session {} started for {}", origin, shared.peer_addr);

        let read_task = tokio::spawn(read_loop(
            reader,
            config.clone(),
            shared.clone(),
            events.clone(),
            shutdown.clone(),
        ));
        let write_task = tokio::spawn(write_loop(
            writer,
            outbound,
            config.drain_timeout,
            shared.clone(),
            shutdown,
        ));

        if let Err(e) = read_task.await {
            shared.close(DisconnectReason::ReadFailed(e.to_string()));
        }
        let unsent = match write_task.await {
            Ok(unsent) => unsent,
            Err(e) => {
                shared.close(DisconnectReason::WriteFailed(e.to_string()));
                0
            }
        };

        if !shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let reason = shared
            .reason
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or(DisconnectReason::PeerClosed);

        if unsent > 0 {
            warn!("Session {} closed with {} unsent frames", origin, unsent);
        }
        info!("Session {} ended: {}", origin, reason);

        let _ = events
            .send(SessionEvent::Disconnected {
                origin,
                reason,
                unsent,
            })
            .await;
    }
}

async fn read_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    config: SessionConfig,
    shared: Arc<Shared>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: CancellationToken,
) {
    let origin = shared.origin;
    let mut decoder = FrameDecoder::new(config.max_frame_len);
    let mut buf = BytesMut::with_capacity(4096);
    let mut decode_errors = 0usize;

    loop {
        // Deliver every complete frame before reading more
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(packet)) => {
                    decode_errors = 0;
                    shared.touch();
                    let event = SessionEvent::PacketReceived { origin, packet };
                    if events.send(event).await.is_err() {
                        shared.close(DisconnectReason::Shutdown);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    decode_errors += 1;
                    warn!("Dropping malformed frame from {}: {}", origin, e);
                    if config.max_decode_errors > 0 && decode_errors >= config.max_decode_errors {
                        shared.close(DisconnectReason::ProtocolViolation(decode_errors));
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = shared.close.cancelled() => return,
            _ = shutdown.cancelled() => {
                shared.close(DisconnectReason::Shutdown);
                return;
            }
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    if !buf.is_empty() {
                        debug!("Session {} closed with {} buffered bytes", origin, buf.len());
                    }
                    shared.close(DisconnectReason::PeerClosed);
                    return;
                }
                Ok(n) => debug!("Read {} bytes from {}", n, origin),
                Err(e) => {
                    shared.close(DisconnectReason::ReadFailed(e.to_string()));
                    return;
                }
            }
        }
    }
}

/// Returns the number of frames left unsent.
///
/// Once the session starts closing, a single deadline `drain_timeout` away
/// bounds both the write in flight and the flush of the remaining queue.
async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Bytes>,
    drain_timeout: Duration,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> usize {
    let deadline = loop {
        let frame = tokio::select! {
            biased;
            _ = closing(&shared, &shutdown) => break Deadline::now() + drain_timeout,
            frame = outbound.recv() => frame,
        };

        let Some(frame) = frame else {
            // Every handle is gone, nothing more can be queued
            closing(&shared, &shutdown).await;
            break Deadline::now() + drain_timeout;
        };

        let write = write_frame(&mut writer, &frame);
        tokio::pin!(write);
        let finished = tokio::select! {
            result = &mut write => Some(result),
            _ = closing(&shared, &shutdown) => None,
        };

        let (result, closed_at) = match finished {
            Some(result) => (result, None),
            None => {
                let deadline = Deadline::now() + drain_timeout;
                match tokio::time::timeout_at(deadline, write).await {
                    Ok(result) => (result, Some(deadline)),
                    Err(_) => {
                        debug!("Abandoned in-flight write to {}", shared.origin);
                        outbound.close();
                        return count_remaining(&mut outbound) + 1;
                    }
                }
            }
        };

        if let Err(e) = result {
            shared.close(DisconnectReason::WriteFailed(e.to_string()));
            outbound.close();
            return count_remaining(&mut outbound);
        }
        if let Some(deadline) = closed_at {
            break deadline;
        }
    };

    // Flush whatever was queued before the close
    outbound.close();
    let mut in_flight = false;
    let drained = tokio::time::timeout_at(deadline, async {
        while let Some(frame) = outbound.recv().await {
            in_flight = true;
            write_frame(&mut writer, &frame).await?;
            in_flight = false;
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    match drained {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Drain failed for {}: {}", shared.origin, e),
        Err(_) => debug!("Drain timed out for {}", shared.origin),
    }

    let _ = tokio::time::timeout_at(deadline, writer.shutdown()).await;
    count_remaining(&mut outbound) + usize::from(in_flight)
}

/// Resolves once the session is closing. Shutdown counts as the reason
/// unless another one was recorded first.
async fn closing(shared: &Shared, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shared.close.cancelled() => {}
        _ = shutdown.cancelled() => shared.close(DisconnectReason::Shutdown),
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

fn count_remaining(outbound: &mut mpsc::Receiver<Bytes>) -> usize {
    let mut remaining = 0;
    while outbound.try_recv().is_ok() {
        remaining += 1;
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, GameData, MessageType, PROTOCOL_VERSION};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn start<S>(stream: S, config: SessionConfig) -> (SessionHandle, mpsc::Receiver<SessionEvent>, CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, handle) = Session::new(stream, Origin::from_int(1), peer(), config);
        let (events_tx, events_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        tokio::spawn(session.run(events_tx, shutdown.clone()));
        (handle, events_rx, shutdown)
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_packets_arrive_in_order_across_reads() {
        let (client, server) = duplex(64);
        let (_handle, mut events, _shutdown) = start(server, SessionConfig::default());
        let (_client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"1.0|6|1|3|1|pos|1,1\n1.0|6|1|3|1|p").await.unwrap();
        client_write.write_all(b"os|2,2\n1.0|3|1|0\n").await.unwrap();

        let mut payloads = Vec::new();
        for _ in 0..3 {
            match next_event(&mut events).await {
                SessionEvent::PacketReceived { origin, packet } => {
                    assert_eq!(origin, Origin::from_int(1));
                    payloads.push(packet.fields().last().cloned().unwrap_or_default());
                }
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert_eq!(payloads, vec!["1,1", "2,2", ""]);
    }

    #[tokio::test]
    async fn test_sends_are_written_in_fifo_order() {
        let (client, server) = duplex(1024);
        let (handle, _events, _shutdown) = start(server, SessionConfig::default());

        for i in 0..20 {
            let packet = GameData {
                player: Origin::from_int(1),
                kind: "tick".to_string(),
                payload: i.to_string(),
            }
            .to_raw(Origin::SERVER);
            handle.send(&packet).await.unwrap();
        }

        let mut lines = BufReader::new(client).lines();
        for i in 0..20 {
            let line = lines.next_line().await.unwrap().unwrap();
            let packet = decode(line.as_bytes()).unwrap();
            assert_eq!(packet.message_type(), MessageType::GameData);
            assert_eq!(packet.fields()[2], i.to_string());
        }
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_once() {
        let (client, server) = duplex(64);
        let (handle, mut events, _shutdown) = start(server, SessionConfig::default());

        drop(client);

        match next_event(&mut events).await {
            SessionEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::PeerClosed)
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.send(&RawPacket::with_code(PROTOCOL_VERSION, 3, Origin::SERVER, vec![])).await,
            Err(SessionError::Closed)
        ));

        // The event channel closes without a second disconnect
        assert!(tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (client, server) = duplex(256);
        let (_handle, mut events, _shutdown) = start(server, SessionConfig::default());
        let (_client_read, mut client_write) = tokio::io::split(client);

        client_write
            .write_all(b"1.0|4|1|3|a|b\nnonsense\n1.0|3|1|0\n")
            .await
            .unwrap();

        match next_event(&mut events).await {
            SessionEvent::PacketReceived { packet, .. } => {
                assert_eq!(packet.message_type(), MessageType::ServerDataRequest)
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeated_decode_errors_close_the_session() {
        let (client, server) = duplex(256);
        let config = SessionConfig {
            max_decode_errors: 2,
            ..Default::default()
        };
        let (_handle, mut events, _shutdown) = start(server, config);
        let (_client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"bad\nworse\n").await.unwrap();

        match next_event(&mut events).await {
            SessionEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::ProtocolViolation(2))
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kick_delivers_notice_before_closing() {
        let (client, server) = duplex(256);
        let (handle, mut events, _shutdown) = start(server, SessionConfig::default());
        let (client_read, _client_write) = tokio::io::split(client);

        handle.kick("idle for too long");

        let mut lines = BufReader::new(client_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, "1.0|8|-1|1|idle for too long");

        match next_event(&mut events).await {
            SessionEvent::Disconnected { reason, unsent, .. } => {
                assert_eq!(reason, DisconnectReason::Kicked("idle for too long".to_string()));
                assert_eq!(unsent, 0);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_reports_unsent_frames() {
        // Nobody reads the client side, so the tiny pipe fills up
        let (_client, server) = duplex(8);
        let config = SessionConfig {
            drain_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (handle, mut events, shutdown) = start(server, config);

        for i in 0..5 {
            let packet = RawPacket::with_code(PROTOCOL_VERSION, 6, Origin::SERVER, vec![i.to_string(); 3]);
            handle.send(&packet).await.unwrap();
        }
        shutdown.cancel();

        match next_event(&mut events).await {
            SessionEvent::Disconnected { reason, unsent, .. } => {
                assert_eq!(reason, DisconnectReason::Shutdown);
                assert!(unsent > 0);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_drains_within_one_deadline() {
        let (client, server) = duplex(16);
        let config = SessionConfig {
            drain_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (handle, mut events, shutdown) = start(server, config);

        // A peer that keeps reading, but slowly
        tokio::spawn(async move {
            let mut client = client;
            let mut buf = [0u8; 16];
            loop {
                tokio::time::sleep(Duration::from_millis(40)).await;
                match client.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        for i in 0..30 {
            let packet = RawPacket::with_code(PROTOCOL_VERSION, 6, Origin::SERVER, vec![i.to_string(); 3]);
            handle.send(&packet).await.unwrap();
        }

        let started = std::time::Instant::now();
        shutdown.cancel();

        match next_event(&mut events).await {
            SessionEvent::Disconnected { reason, unsent, .. } => {
                assert_eq!(reason, DisconnectReason::Shutdown);
                assert!(unsent > 0);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_millis(600), "close took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_send_fails_once_closing() {
        // The pipe stays full so the session cannot finish closing yet
        let (_client, server) = duplex(8);
        let config = SessionConfig {
            drain_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (handle, _events, _shutdown) = start(server, config);
        let packet = RawPacket::with_code(PROTOCOL_VERSION, 3, Origin::SERVER, vec![]);

        handle.send(&packet).await.unwrap();
        handle.close();

        assert!(!handle.is_connected());
        assert!(matches!(handle.send(&packet).await, Err(SessionError::Closed)));
        assert!(matches!(handle.try_send(&packet), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_try_send_reports_a_full_queue() {
        let (_client, server) = duplex(8);
        let config = SessionConfig {
            send_queue: 2,
            ..Default::default()
        };
        let (handle, _events, _shutdown) = start(server, config);
        let packet = RawPacket::with_code(PROTOCOL_VERSION, 6, Origin::SERVER, vec!["x".repeat(32); 3]);

        let mut overloaded = false;
        for _ in 0..8 {
            match handle.try_send(&packet) {
                Ok(()) => tokio::task::yield_now().await,
                Err(SessionError::Overloaded) => {
                    overloaded = true;
                    break;
                }
                Err(e) => panic!("Unexpected error: {}", e),
            }
        }
        assert!(overloaded);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_idle_time_resets_on_activity() {
        let stream = tokio_test::io::Builder::new()
            .wait(Duration::from_millis(50))
            .read(b"1.0|3|1|0\n")
            .wait(Duration::from_millis(200))
            .build();
        let (handle, mut events, _shutdown) = start(stream, SessionConfig::default());

        next_event(&mut events).await;
        assert!(handle.idle_time() < Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.idle_time() >= Duration::from_millis(60));
    }
}
