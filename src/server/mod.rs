//! Game server - Connects the listener to the dispatch pipeline
//!
//! Decoded packets are mapped to typed requests, queries and notifications;
//! whatever the handlers answer is mapped back to packets and written to the
//! originating session or fanned out to other players.
//!
//! Each session gets its own worker task, so packets from one player are
//! handled in arrival order while players never wait on each other.

mod handlers;

pub use handlers::*;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{Config, ConfigError};
use crate::dispatch::{
    ConfigurationError, DispatchResult, ErrorLogger, Mediator, Middleware, QueryDispatcher,
    SlowRequestLogger,
};
use crate::network::{
    DisconnectReason, ExternalAddressProvider, Listener, ListenerConfig, ListenerError,
    ListenerEvent, NoExternalAddress, SessionRegistry, StaticExternalAddress,
};
use crate::protocol::{
    BattleData, GameData, Handshake, Origin, Packet, RawPacket, TypedPacket, WorldState,
};

/// Reason sent to players removed by the idle sweep
pub const AFK_KICK_REASON: &str = "idle for too long";

/// Reason sent to players whose packets arrive faster than they are handled
pub const FLOOD_KICK_REASON: &str = "too many pending requests";

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dispatch setup error: {0}")]
    Dispatch(#[from] ConfigurationError),

    #[error("Event stream already taken")]
    EventsTaken,
}

pub type ServerResult<T> = Result<T, ServerError>;

/// A running game server
pub struct GameServer {
    config: Config,
    listener: Listener,
    events: Option<mpsc::Receiver<ListenerEvent>>,
    context: Arc<ServerContext>,
    workers: PlayerWorkers,
}

impl GameServer {
    /// Create a server; a configured public address is announced as the external endpoint
    pub fn new(config: Config) -> ServerResult<Self> {
        let nat: Arc<dyn ExternalAddressProvider> = match config.public_address()? {
            Some(addr) => Arc::new(StaticExternalAddress(addr)),
            None => Arc::new(NoExternalAddress),
        };
        Self::with_nat(config, nat)
    }

    pub fn with_nat(config: Config, nat: Arc<dyn ExternalAddressProvider>) -> ServerResult<Self> {
        let mut listener = Listener::new(ListenerConfig::from(&config), nat);
        let events = listener.take_event_receiver();
        let sessions = listener.sessions();
        let roster = Roster::new(config.server.max_players);
        let (mediator, queries) = build_dispatch(&config, &roster, &sessions)?;

        let context = Arc::new(ServerContext {
            mediator,
            queries,
            roster,
            sessions,
            shutdown: CancellationToken::new(),
        });
        let workers = PlayerWorkers::new(context.clone(), config.dispatch.pending_packets);

        Ok(Self {
            config,
            listener,
            events,
            context,
            workers,
        })
    }

    /// Token that ends [`GameServer::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    /// Shared state the packet handlers work on
    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    pub fn roster(&self) -> &Roster {
        &self.context.roster
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.context.sessions
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start listening
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        let addr = self.listener.start().await?;
        info!(
            "Server '{}' accepting up to {} players on {}",
            self.config.server.name, self.config.server.max_players, addr
        );
        Ok(addr)
    }

    /// Process listener events until the shutdown token is cancelled, then stop.
    pub async fn run(&mut self) -> ServerResult<()> {
        let mut events = self.events.take().ok_or(ServerError::EventsTaken)?;

        let afk_limit = self.config.policy.afk_limit();
        let mut afk_sweep = tokio::time::interval(self.config.policy.afk_check_interval());
        afk_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.context.shutdown.cancelled() => break,
                Some(event) = events.recv() => self.workers.route(event).await,
                Some(joined) = self.workers.tasks.join_next() => PlayerWorkers::reap(joined),
                _ = afk_sweep.tick(), if afk_limit.is_some() => {
                    if let Some(limit) = afk_limit {
                        let kicked = self.context.sessions.kick_idle(limit, AFK_KICK_REASON).await;
                        if !kicked.is_empty() {
                            info!("Kicked {} idle players", kicked.len());
                        }
                    }
                }
            }
        }

        info!("Shutting down");
        let stop = self.listener.stop();
        tokio::pin!(stop);

        // Keep draining so the listener never blocks on a full event channel
        let result = loop {
            tokio::select! {
                result = &mut stop => break result,
                Some(event) = events.recv() => self.workers.route(event).await,
            }
        };

        while let Ok(event) = events.try_recv() {
            self.workers.route(event).await;
        }
        self.workers
            .finish(Duration::from_millis(self.config.network.shutdown_grace_ms))
            .await;

        self.events = Some(events);
        result.map_err(ServerError::from)
    }

    /// Send the current world state to every joined player
    pub async fn broadcast_world_state(&self, state: &WorldState) -> usize {
        self.context.broadcast_world_state(state).await
    }
}

/// Dispatch pipelines and player state shared by every packet worker
pub struct ServerContext {
    mediator: Mediator,
    queries: QueryDispatcher,
    roster: Roster,
    sessions: SessionRegistry,
    shutdown: CancellationToken,
}

impl ServerContext {
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Map a packet from `origin` onto the dispatch pipeline and answer it.
    ///
    /// `origin` is the session the packet arrived on; the origin claimed in
    /// the packet header is not trusted.
    pub async fn handle_packet(&self, origin: Origin, raw: RawPacket) {
        let packet = match Packet::from_raw(&raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping {:?} from {}: {}", raw.message_type(), origin, e);
                return;
            }
        };

        if raw.origin() != origin && !raw.origin().is_new_player() {
            debug!("{} sent a packet claiming to be {}", origin, raw.origin());
        }

        let result = match packet {
            Packet::Handshake(handshake) => self.on_handshake(origin, raw.version(), handshake).await,
            Packet::ServerDataRequest(_) => self.on_server_data_request(origin).await,
            Packet::GameData(data) => self.on_game_data(origin, data).await,
            Packet::BattleData(battle) => self.on_battle_data(origin, battle).await,
            Packet::Disconnect(notice) => {
                debug!("{} is leaving: {}", origin, notice.reason);
                if let Some(handle) = self.sessions.get(origin).await {
                    handle.close();
                }
                Ok(())
            }
            other => {
                debug!("Ignoring {:?} from {}", other.message_type(), origin);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("Packet from {} not handled: {}", origin, e);
        }
    }

    async fn on_handshake(&self, origin: Origin, version: &str, handshake: Handshake) -> DispatchResult<()> {
        let login = Login {
            origin,
            version: version.to_string(),
            player_name: handshake.player_name,
        };
        let response = self.mediator.send_with(login, &self.shutdown).await?;
        let accepted = response.accepted;
        let reason = response.reason.clone();

        self.reply(origin, &response.to_raw(Origin::SERVER)).await;
        if !accepted {
            if let Some(handle) = self.sessions.get(origin).await {
                handle.kick(&reason);
            }
        }
        Ok(())
    }

    async fn on_server_data_request(&self, origin: Origin) -> DispatchResult<()> {
        let info = self.queries.dispatch_with(ServerInfoQuery, &self.shutdown).await?;
        self.reply(origin, &info.to_raw(Origin::SERVER)).await;
        Ok(())
    }

    async fn on_game_data(&self, origin: Origin, data: GameData) -> DispatchResult<()> {
        if !self.roster.contains(origin).await {
            debug!("Ignoring game data from {} before login", origin);
            return Ok(());
        }
        if data.player != origin {
            debug!("{} sent game data for {}", origin, data.player);
        }

        let update = PlayerDataUpdated {
            origin,
            kind: data.kind,
            payload: data.payload,
        };
        self.mediator.publish_with(update, &self.shutdown).await
    }

    async fn on_battle_data(&self, origin: Origin, battle: BattleData) -> DispatchResult<()> {
        if !self.roster.contains(origin).await {
            debug!("Ignoring battle data from {} before login", origin);
            return Ok(());
        }

        let relay = RelayBattleData {
            from: origin,
            partner: battle.partner,
            payload: battle.payload,
        };
        self.mediator.send_with(relay, &self.shutdown).await
    }

    async fn reply(&self, origin: Origin, packet: &RawPacket) {
        if let Err(e) = self.sessions.send_to(origin, packet).await {
            debug!("Reply to {} dropped: {}", origin, e);
        }
    }

    /// Send the current world state to every joined player
    pub async fn broadcast_world_state(&self, state: &WorldState) -> usize {
        let packet = state.to_raw(Origin::SERVER);
        send_to_players(&self.roster, &self.sessions, &packet, None).await
    }
}

/// The pending packets of one session and the reason it ended
struct Worker {
    packets: mpsc::Sender<RawPacket>,
    closed: oneshot::Sender<DisconnectReason>,
}

/// One task per live session, fed by the listener's event stream
struct PlayerWorkers {
    context: Arc<ServerContext>,
    queues: HashMap<Origin, Worker>,
    tasks: JoinSet<()>,
    capacity: usize,
}

impl PlayerWorkers {
    fn new(context: Arc<ServerContext>, capacity: usize) -> Self {
        Self {
            context,
            queues: HashMap::new(),
            tasks: JoinSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// React to one listener event without waiting on any session
    async fn route(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Started {
                local_addr,
                external_addr,
            } => match external_addr {
                Some(external) => info!("Started on {} (public {})", local_addr, external),
                None => info!("Started on {}", local_addr),
            },
            ListenerEvent::SessionOpened { origin, addr } => {
                debug!("Session {} opened from {}", origin, addr);
                self.worker(origin);
            }
            ListenerEvent::PacketReceived { origin, packet } => {
                self.enqueue(origin, packet).await;
            }
            ListenerEvent::SessionClosed {
                origin,
                reason,
                unsent,
            } => {
                if unsent > 0 {
                    debug!("{} frames for {} were never sent", unsent, origin);
                }
                self.close(origin, reason);
            }
            ListenerEvent::Rejected { addr, reason } => {
                info!("Turned away {}: {}", addr, reason);
            }
            ListenerEvent::Stopped => info!("Listener stopped"),
            ListenerEvent::Error { message } => warn!("Listener error: {}", message),
        }
    }

    fn worker(&mut self, origin: Origin) -> &Worker {
        let Self {
            context,
            queues,
            tasks,
            capacity,
        } = self;
        queues
            .entry(origin)
            .or_insert_with(|| spawn_worker(context.clone(), origin, *capacity, tasks))
    }

    async fn enqueue(&mut self, origin: Origin, packet: RawPacket) {
        match self.worker(origin).packets.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} has too many packets pending, disconnecting", origin);
                if let Some(handle) = self.context.sessions.get(origin).await {
                    handle.kick(FLOOD_KICK_REASON);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dropping packet from {}: worker has stopped", origin);
            }
        }
    }

    /// Let the worker finish what is queued, then clean up after the player
    fn close(&mut self, origin: Origin, reason: DisconnectReason) {
        let worker = match self.queues.remove(&origin) {
            Some(worker) => worker,
            None => spawn_worker(self.context.clone(), origin, self.capacity, &mut self.tasks),
        };
        let _ = worker.closed.send(reason);
    }

    fn reap(joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            warn!("Packet worker failed: {}", e);
        }
    }

    /// Close every remaining worker and wait for them, aborting after `grace`
    async fn finish(&mut self, grace: Duration) {
        for (_, worker) in self.queues.drain() {
            let _ = worker.closed.send(DisconnectReason::Shutdown);
        }

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                Self::reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} packet workers after shutdown grace", self.tasks.len());
            self.tasks.abort_all();
        }
    }
}

fn spawn_worker(
    context: Arc<ServerContext>,
    origin: Origin,
    capacity: usize,
    tasks: &mut JoinSet<()>,
) -> Worker {
    let (packets, mut queue) = mpsc::channel::<RawPacket>(capacity);
    let (closed, reason) = oneshot::channel();

    tasks.spawn(async move {
        while let Some(packet) = queue.recv().await {
            context.handle_packet(origin, packet).await;
        }
        let reason = reason.await.unwrap_or(DisconnectReason::Shutdown);
        player_left(&context.mediator, origin, &reason).await;
    });

    Worker { packets, closed }
}

/// The error logger in the pipeline already reports handler failures
async fn player_left(mediator: &Mediator, origin: Origin, reason: &DisconnectReason) {
    let left = PlayerLeft {
        origin,
        reason: reason.to_string(),
    };
    if let Err(e) = mediator.publish(left).await {
        debug!("Cleanup after {} incomplete: {}", origin, e);
    }
}

fn build_dispatch(
    config: &Config,
    roster: &Roster,
    sessions: &SessionRegistry,
) -> Result<(Mediator, QueryDispatcher), ConfigurationError> {
    let slow: Arc<dyn Middleware> = Arc::new(SlowRequestLogger::new(
        config.dispatch.slow_request_threshold(),
    ));
    let errors: Arc<dyn Middleware> = Arc::new(ErrorLogger);

    let mediator = Mediator::builder()
        .shared_middleware(slow.clone())
        .shared_middleware(errors.clone())
        .post_processor::<Login, _>(JoinAnnouncer)
        .pre_processor::<RelayBattleData, _>(PartnerOnline::new(roster.clone()))
        .handler::<Login, _>(LoginHandler::new(roster.clone()))
        .handler::<RelayBattleData, _>(BattleRelay::new(sessions.clone()))
        .notification_handler::<PlayerDataUpdated, _>(GameDataRelay::new(
            roster.clone(),
            sessions.clone(),
        ))
        .notification_handler::<PlayerLeft, _>(RosterCleanup::new(roster.clone()))
        .require::<Login>()
        .require::<RelayBattleData>()
        .build()?;

    let queries = QueryDispatcher::builder()
        .shared_middleware(slow)
        .shared_middleware(errors)
        .handler::<ServerInfoQuery, _>(ServerInfoHandler::new(
            roster.clone(),
            config.server.name.clone(),
            config.server.description.clone(),
        ))
        .require::<ServerInfoQuery>()
        .build()?;

    Ok((mediator, queries))
}
