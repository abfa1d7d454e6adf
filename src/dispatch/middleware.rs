//! Built-in cross-cutting middlewares.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::error::{DispatchError, DispatchResult};
use super::pipeline::{Envelope, Middleware, Next, Reply};
use super::Request;
use crate::cancel::CancellationToken;

/// Requests slower than this are reported by [`SlowRequestLogger`]
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(500);

/// Warns about requests whose processing exceeds a threshold.
///
/// Never changes the result.
pub struct SlowRequestLogger {
    threshold: Duration,
}

impl SlowRequestLogger {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

impl Default for SlowRequestLogger {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_THRESHOLD)
    }
}

#[async_trait]
impl Middleware for SlowRequestLogger {
    async fn handle(&self, envelope: &Envelope<'_>, next: Next<'_>) -> DispatchResult<Reply> {
        let started = Instant::now();
        let result = next.run(envelope).await;
        let elapsed = started.elapsed();

        if elapsed > self.threshold {
            warn!(
                request = envelope.type_name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Long running request: {:?}",
                envelope.message()
            );
        }

        result
    }
}

/// Failure boundary: logs every error (and panic) raised further down the
/// chain together with the request, then hands the failure back unchanged.
///
/// A panic is reported as [`DispatchError::Panicked`].
#[derive(Default)]
pub struct ErrorLogger;

#[async_trait]
impl Middleware for ErrorLogger {
    async fn handle(&self, envelope: &Envelope<'_>, next: Next<'_>) -> DispatchResult<Reply> {
        let outcome = AssertUnwindSafe(next.run(envelope)).catch_unwind().await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(DispatchError::Panicked {
                request: envelope.type_name(),
                message: panic_message(panic.as_ref()),
            }),
        };

        match &result {
            Err(e) if e.is_cancelled() => {
                debug!(request = envelope.type_name(), "Request cancelled");
            }
            Err(e) => {
                error!(
                    request = envelope.type_name(),
                    error = %e,
                    "Unhandled failure for request {:?}",
                    envelope.message()
                );
            }
            Ok(_) => {}
        }

        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A side effect run before the handler of `R`.
#[async_trait]
pub trait PreProcessor<R: Request>: Send + Sync + 'static {
    async fn process(&self, request: &R, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// A side effect run after the handler of `R`, with access to its response.
#[async_trait]
pub trait PostProcessor<R: Request>: Send + Sync + 'static {
    async fn process(
        &self,
        request: &R,
        response: &R::Response,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Adapts a [`PreProcessor`] into a chain stage. A failing pre-step aborts
/// the chain before the inner stages run.
pub struct PreProcessorStage<R, P> {
    processor: P,
    _request: PhantomData<fn(R)>,
}

impl<R, P> PreProcessorStage<R, P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            _request: PhantomData,
        }
    }
}

#[async_trait]
impl<R, P> Middleware for PreProcessorStage<R, P>
where
    R: Request,
    P: PreProcessor<R>,
{
    async fn handle(&self, envelope: &Envelope<'_>, next: Next<'_>) -> DispatchResult<Reply> {
        if let Some(request) = envelope.downcast_ref::<R>() {
            self.processor
                .process(request, envelope.cancellation())
                .await
                .map_err(|source| DispatchError::handler(envelope.type_name(), source))?;
        }
        next.run(envelope).await
    }
}

/// Adapts a [`PostProcessor`] into a chain stage. The inner stages always
/// run first; a failing post-step is reported after the response exists.
pub struct PostProcessorStage<R, P> {
    processor: P,
    _request: PhantomData<fn(R)>,
}

impl<R, P> PostProcessorStage<R, P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            _request: PhantomData,
        }
    }
}

#[async_trait]
impl<R, P> Middleware for PostProcessorStage<R, P>
where
    R: Request,
    P: PostProcessor<R>,
{
    async fn handle(&self, envelope: &Envelope<'_>, next: Next<'_>) -> DispatchResult<Reply> {
        let reply = next.run(envelope).await?;

        if let Some(request) = envelope.downcast_ref::<R>() {
            let response = reply
                .downcast_ref::<R::Response>()
                .ok_or(DispatchError::ResponseType {
                    request: envelope.type_name(),
                })?;
            self.processor
                .process(request, response, envelope.cancellation())
                .await
                .map_err(|source| DispatchError::handler(envelope.type_name(), source))?;
        }

        Ok(reply)
    }
}
