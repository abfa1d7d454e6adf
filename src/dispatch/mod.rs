//! Dispatch module - Routes typed messages to handlers through middleware
//!
//! Provides:
//! - [`Mediator`] for commands (exactly one handler) and notifications (fan-out)
//! - [`QueryDispatcher`], the read-side path with its own chain and cache
//! - Built-in middlewares for slow-request logging, failure containment and
//!   pre/post processing

mod error;
#[cfg(test)]
pub(crate) mod log_capture;
mod mediator;
mod middleware;
mod pipeline;
mod query;

pub use error::{ConfigurationError, DispatchError, DispatchResult};
pub use mediator::{Mediator, MediatorBuilder};
pub use middleware::{
    ErrorLogger, PostProcessor, PostProcessorStage, PreProcessor, PreProcessorStage,
    SlowRequestLogger, DEFAULT_SLOW_THRESHOLD,
};
pub use pipeline::{AnyMessage, Envelope, Middleware, Next, Reply};
pub use query::{QueryDispatcher, QueryDispatcherBuilder};

use async_trait::async_trait;
use std::fmt::Debug;

use crate::cancel::CancellationToken;

/// A command sent to exactly one handler.
///
/// Fire-and-forget commands use `()` as their response.
pub trait Request: Debug + Send + Sync + 'static {
    type Response: Send + Sync + 'static;
}

/// An event delivered to every registered handler.
pub trait Notification: Debug + Send + Sync + 'static {}

/// A read-only question answered by exactly one handler.
pub trait Query: Debug + Send + Sync + 'static {
    type Output: Send + Sync + 'static;
}

#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    async fn handle(&self, request: &R, cancel: &CancellationToken) -> anyhow::Result<R::Response>;
}

#[async_trait]
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    async fn handle(&self, notification: &N, cancel: &CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    async fn handle(&self, query: &Q, cancel: &CancellationToken) -> anyhow::Result<Q::Output>;
}
