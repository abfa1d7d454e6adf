//! Network module - Handles TCP sessions for game clients
//!
//! Provides:
//! - Listener for accepting incoming connections
//! - Session for framed, ordered packet exchange on one connection
//! - A registry of live sessions for targeted sends and broadcasts

mod listener;
mod nat;
mod registry;
mod session;

pub use listener::*;
pub use nat::*;
pub use registry::*;
pub use session::*;

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the listener and the sessions it creates
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Interface to bind to
    pub bind_address: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Connections beyond this many players are turned away
    pub max_players: usize,
    /// Maximum frame size in bytes
    pub max_frame_len: usize,
    /// Consecutive malformed frames before a session is closed (0 = never)
    pub max_decode_errors: usize,
    /// Outgoing frames buffered per session
    pub send_queue: usize,
    /// Time allowed to flush queued frames when a session closes
    pub drain_timeout: Duration,
    /// Time allowed for sessions to finish when the listener stops
    pub shutdown_grace: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            max_players: 20,
            max_frame_len: crate::protocol::DEFAULT_MAX_FRAME_LEN,
            max_decode_errors: 8,
            send_queue: 256,
            drain_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl ListenerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_max_players(mut self, max_players: usize) -> Self {
        self.max_players = max_players;
        self
    }

    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl From<&crate::config::Config> for ListenerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            bind_address: config.network.bind_address.clone(),
            port: config.network.port,
            max_players: config.server.max_players,
            max_frame_len: config.network.max_frame_len,
            max_decode_errors: config.network.max_decode_errors,
            send_queue: config.network.send_queue,
            drain_timeout: Duration::from_millis(config.network.drain_timeout_ms),
            shutdown_grace: Duration::from_millis(config.network.shutdown_grace_ms),
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
