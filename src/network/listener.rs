//! Game listener
//!
//! The listener accepts TCP connections, assigns each one a player origin
//! and runs it as a [`Session`]. Everything the sessions report is funneled
//! into a single [`ListenerEvent`] stream.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::nat::ExternalAddressProvider;
use super::registry::SessionRegistry;
use super::session::{DisconnectReason, Session, SessionConfig, SessionError, SessionEvent};
use super::ListenerConfig;
use crate::cancel::CancellationToken;
use crate::protocol::{encode_frame, Disconnect, Origin, RawPacket, TypedPacket};

/// Reason sent to connections turned away at capacity
pub const SERVER_FULL_REASON: &str = "server full";

/// Listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Listener already running")]
    AlreadyRunning,

    #[error("Listener not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("No session for {0}")]
    UnknownSession(Origin),
}

pub type ListenerResult<T> = Result<T, ListenerError>;

/// Events emitted by the listener
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// Listening; `external_addr` is set when a public endpoint was acquired
    Started {
        local_addr: SocketAddr,
        external_addr: Option<SocketAddr>,
    },
    /// A connection was accepted and given an origin
    SessionOpened { origin: Origin, addr: SocketAddr },
    /// A packet arrived on a session
    PacketReceived { origin: Origin, packet: RawPacket },
    /// A session ended
    SessionClosed {
        origin: Origin,
        reason: DisconnectReason,
        unsent: usize,
    },
    /// A connection was refused before a session was created
    Rejected { addr: SocketAddr, reason: String },
    /// The accept loop has exited and all sessions are gone
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Accepts game clients and owns their sessions
pub struct Listener {
    config: ListenerConfig,
    nat: Arc<dyn ExternalAddressProvider>,
    sessions: SessionRegistry,
    event_tx: mpsc::Sender<ListenerEvent>,
    event_rx: Option<mpsc::Receiver<ListenerEvent>>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Listener {
    /// Create a new listener
    pub fn new(config: ListenerConfig, nat: Arc<dyn ExternalAddressProvider>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            nat,
            sessions: SessionRegistry::new(),
            event_tx,
            event_rx: Some(event_rx),
            shutdown: CancellationToken::new(),
            accept_task: None,
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ListenerEvent>> {
        self.event_rx.take()
    }

    /// Bind, acquire an external endpoint and start accepting connections
    pub async fn start(&mut self) -> ListenerResult<SocketAddr> {
        if self.is_running() {
            return Err(ListenerError::AlreadyRunning);
        }

        let bind_addr = self.config.bind_target();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ListenerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let external_addr = self.nat.acquire_external_endpoint(local_addr.port()).await;
        match external_addr {
            Some(addr) => info!("Reachable externally at {}", addr),
            None => debug!("No external endpoint for port {}", local_addr.port()),
        }

        let _ = self
            .event_tx
            .send(ListenerEvent::Started {
                local_addr,
                external_addr,
            })
            .await;

        self.shutdown = CancellationToken::new();
        self.local_addr = Some(local_addr);
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            self.sessions.clone(),
            self.event_tx.clone(),
            self.shutdown.clone(),
        )));

        Ok(local_addr)
    }

    /// Stop accepting, close every session and wait for the accept loop.
    ///
    /// Sessions get `shutdown_grace` to flush; stragglers are aborted.
    pub async fn stop(&mut self) -> ListenerResult<()> {
        let task = self.accept_task.take().ok_or(ListenerError::NotRunning)?;

        self.shutdown.cancel();
        if let Err(e) = task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        if let Some(addr) = self.local_addr.take() {
            self.nat.release_external_endpoint(addr.port()).await;
        }

        info!("Listener stopped");
        Ok(())
    }

    /// Check if the accept loop is alive
    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Live sessions
    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Send a packet to a specific session
    pub async fn send_to(&self, origin: Origin, packet: &RawPacket) -> ListenerResult<()> {
        let handle = self
            .sessions
            .get(origin)
            .await
            .ok_or(ListenerError::UnknownSession(origin))?;
        handle.send(packet).await?;
        Ok(())
    }

    /// Send a packet to all sessions, optionally skipping one
    pub async fn broadcast(&self, packet: &RawPacket, except: Option<Origin>) -> usize {
        self.sessions.broadcast(packet, except).await
    }

    /// Notify a session and close it
    pub async fn kick(&self, origin: Origin, reason: &str) -> ListenerResult<()> {
        let handle = self
            .sessions
            .get(origin)
            .await
            .ok_or(ListenerError::UnknownSession(origin))?;
        handle.kick(reason);
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ListenerConfig,
    sessions: SessionRegistry,
    event_tx: mpsc::Sender<ListenerEvent>,
    shutdown: CancellationToken,
) {
    let session_config = SessionConfig::from(&config);
    let (session_tx, mut session_rx) = mpsc::channel::<SessionEvent>(config.send_queue.max(1));
    let mut tasks = JoinSet::new();
    let mut next_id: i32 = 1;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Listener shutdown requested");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let origin = if sessions.len().await >= config.max_players {
                            None
                        } else {
                            sessions.allocate_origin(&mut next_id).await
                        };

                        if let Some(origin) = origin {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Could not disable Nagle for {}: {}", addr, e);
                            }

                            info!("New connection from {} as {}", addr, origin);
                            let (session, handle) = Session::new(stream, origin, addr, session_config.clone());
                            sessions.insert(handle).await;
                            tasks.spawn(session.run(session_tx.clone(), shutdown.clone()));

                            let _ = event_tx.send(ListenerEvent::SessionOpened { origin, addr }).await;
                        } else {
                            info!("Rejecting {}: {}", addr, SERVER_FULL_REASON);
                            tokio::spawn(reject(stream, addr));
                            let _ = event_tx.send(ListenerEvent::Rejected {
                                addr,
                                reason: SERVER_FULL_REASON.to_string(),
                            }).await;
                        }
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        let _ = event_tx.send(ListenerEvent::Error {
                            message: e.to_string(),
                        }).await;
                    }
                }
            }
            Some(event) = session_rx.recv() => {
                let event = translate(event, &sessions).await;
                let _ = event_tx.send(event).await;
            }
            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined {
                    warn!("Session task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    drop(session_tx);

    // Sessions see the same shutdown token; collect their final events
    let grace = tokio::time::sleep(config.shutdown_grace);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            Some(event) = session_rx.recv() => {
                let event = translate(event, &sessions).await;
                publish_nowait(&event_tx, event);
            }
            joined = tasks.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            _ = &mut grace => {
                warn!("Aborting {} sessions after shutdown grace", tasks.len());
                tasks.abort_all();
                break;
            }
        }
    }

    while let Ok(event) = session_rx.try_recv() {
        let event = translate(event, &sessions).await;
        publish_nowait(&event_tx, event);
    }

    let abandoned = sessions.clear().await;
    if abandoned > 0 {
        warn!("{} sessions ended without a disconnect report", abandoned);
    }

    publish_nowait(&event_tx, ListenerEvent::Stopped);
}

/// Map a session event to a listener event, dropping closed sessions from the registry
async fn translate(event: SessionEvent, sessions: &SessionRegistry) -> ListenerEvent {
    match event {
        SessionEvent::PacketReceived { origin, packet } => {
            ListenerEvent::PacketReceived { origin, packet }
        }
        SessionEvent::Disconnected {
            origin,
            reason,
            unsent,
        } => {
            sessions.remove(origin).await;
            ListenerEvent::SessionClosed {
                origin,
                reason,
                unsent,
            }
        }
    }
}

/// During shutdown nobody may be draining the event channel
fn publish_nowait(event_tx: &mpsc::Sender<ListenerEvent>, event: ListenerEvent) {
    if let Err(e) = event_tx.try_send(event) {
        debug!("Dropped listener event during shutdown: {}", e);
    }
}

async fn reject(mut stream: TcpStream, addr: SocketAddr) {
    let notice = Disconnect {
        reason: SERVER_FULL_REASON.to_string(),
    }
    .to_raw(Origin::SERVER);

    let result = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        stream.write_all(&encode_frame(&notice)).await?;
        stream.shutdown().await
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to notify rejected client {}: {}", addr, e),
        Err(_) => debug!("Timed out notifying rejected client {}", addr),
    }
}
