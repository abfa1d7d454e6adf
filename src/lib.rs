//! playnet - Network core for real-time multiplayer game servers
//!
//! A line-oriented wire protocol, TCP sessions that frame it, and a typed
//! request/query dispatch pipeline with composable middleware.

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod network;
pub mod protocol;
pub mod server;

pub use cancel::CancellationToken;
pub use config::Config;
pub use server::GameServer;
