//! Command and notification routing.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::{type_name, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use super::error::{ConfigurationError, DispatchError, DispatchResult};
use super::middleware::{PostProcessor, PostProcessorStage, PreProcessor, PreProcessorStage};
use super::pipeline::{Endpoint, Envelope, Middleware, PipelineTable, Reply, TableBuilder};
use super::{Notification, NotificationHandler, Request, RequestHandler};
use crate::cancel::CancellationToken;

struct RequestEndpoint<R, H> {
    handler: Arc<H>,
    _request: PhantomData<fn(R)>,
}

#[async_trait]
impl<R, H> Endpoint for RequestEndpoint<R, H>
where
    R: Request,
    H: RequestHandler<R>,
{
    async fn call(&self, envelope: &Envelope<'_>) -> DispatchResult<Reply> {
        let request = envelope
            .downcast_ref::<R>()
            .ok_or(DispatchError::RequestType {
                request: envelope.type_name(),
            })?;
        let response = self
            .handler
            .handle(request, envelope.cancellation())
            .await
            .map_err(|source| DispatchError::handler(envelope.type_name(), source))?;
        Ok(Box::new(response))
    }
}

struct NotificationEndpoint<N, H> {
    handler: Arc<H>,
    _notification: PhantomData<fn(N)>,
}

#[async_trait]
impl<N, H> Endpoint for NotificationEndpoint<N, H>
where
    N: Notification,
    H: NotificationHandler<N>,
{
    async fn call(&self, envelope: &Envelope<'_>) -> DispatchResult<Reply> {
        let notification = envelope
            .downcast_ref::<N>()
            .ok_or(DispatchError::RequestType {
                request: envelope.type_name(),
            })?;
        self.handler
            .handle(notification, envelope.cancellation())
            .await
            .map_err(|source| DispatchError::handler(type_name::<H>(), source))?;
        Ok(Box::new(()))
    }
}

/// Routes commands to their single handler and notifications to all of
/// theirs, each through its middleware chain.
pub struct Mediator {
    requests: PipelineTable,
    notifications: PipelineTable,
}

impl Mediator {
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::default()
    }

    /// Send a command to its handler and wait for the response.
    pub async fn send<R: Request>(&self, request: R) -> DispatchResult<R::Response> {
        self.send_with(request, &CancellationToken::new()).await
    }

    pub async fn send_with<R: Request>(
        &self,
        request: R,
        cancel: &CancellationToken,
    ) -> DispatchResult<R::Response> {
        let request_name = type_name::<R>();
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled {
                request: request_name,
            });
        }

        let pipelines = self
            .requests
            .resolve(TypeId::of::<R>())
            .ok_or(ConfigurationError::NoHandler(request_name))?;
        let pipeline = match pipelines.as_slice() {
            [single] => single,
            [] => return Err(ConfigurationError::NoHandler(request_name).into()),
            many => {
                return Err(ConfigurationError::MultipleHandlers {
                    request: request_name,
                    count: many.len(),
                }
                .into())
            }
        };

        let envelope = Envelope::new(&request, cancel);
        let reply = pipeline.invoke(&envelope).await?;

        reply
            .downcast::<R::Response>()
            .map(|response| *response)
            .map_err(|_| DispatchError::ResponseType {
                request: request_name,
            })
    }

    /// Deliver a notification to every handler registered for it.
    ///
    /// Handlers run concurrently. A failing handler does not stop the others;
    /// all failures are returned together as [`DispatchError::Aggregate`].
    pub async fn publish<N: Notification>(&self, notification: N) -> DispatchResult<()> {
        self.publish_with(notification, &CancellationToken::new()).await
    }

    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        cancel: &CancellationToken,
    ) -> DispatchResult<()> {
        let notification_name = type_name::<N>();
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled {
                request: notification_name,
            });
        }

        let Some(pipelines) = self.notifications.resolve(TypeId::of::<N>()) else {
            debug!("No handlers for notification {}", notification_name);
            return Ok(());
        };

        let envelope = Envelope::new(&notification, cancel);
        let mut running: FuturesUnordered<_> = pipelines
            .iter()
            .map(|pipeline| pipeline.invoke(&envelope))
            .collect();

        let mut failures = Vec::new();
        while let Some(result) = running.next().await {
            if let Err(e) = result {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Aggregate {
                notification: notification_name,
                total: pipelines.len(),
                failures,
            })
        }
    }
}

/// Collects handlers and middlewares for a [`Mediator`].
#[derive(Default)]
pub struct MediatorBuilder {
    requests: TableBuilder,
    notifications: TableBuilder,
    required: Vec<(TypeId, &'static str)>,
}

impl MediatorBuilder {
    /// Register the handler for a command type.
    pub fn handler<R, H>(self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let handler = Arc::new(handler);
        self.handler_factory::<R, H, _>(move || handler.clone())
    }

    /// Register a handler constructed on the first send of `R`.
    pub fn handler_factory<R, H, F>(mut self, factory: F) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
        F: Fn() -> Arc<H> + Send + Sync + 'static,
    {
        self.requests.add_handler(
            TypeId::of::<R>(),
            type_name::<R>(),
            Box::new(move || {
                Arc::new(RequestEndpoint::<R, H> {
                    handler: factory(),
                    _request: PhantomData,
                }) as Arc<dyn Endpoint>
            }),
        );
        self
    }

    /// Add a handler for a notification type; any number may be added.
    pub fn notification_handler<N, H>(self, handler: H) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let handler = Arc::new(handler);
        self.notification_handler_factory::<N, H, _>(move || handler.clone())
    }

    pub fn notification_handler_factory<N, H, F>(mut self, factory: F) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
        F: Fn() -> Arc<H> + Send + Sync + 'static,
    {
        self.notifications.add_handler(
            TypeId::of::<N>(),
            type_name::<N>(),
            Box::new(move || {
                Arc::new(NotificationEndpoint::<N, H> {
                    handler: factory(),
                    _notification: PhantomData,
                }) as Arc<dyn Endpoint>
            }),
        );
        self
    }

    /// Add a middleware around every command and notification handler.
    ///
    /// The first middleware added is the outermost.
    pub fn middleware<M: Middleware>(self, middleware: M) -> Self {
        self.shared_middleware(Arc::new(middleware))
    }

    /// Add an already shared middleware instance to every chain.
    pub fn shared_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.requests.add_middleware(middleware.clone());
        self.notifications.add_middleware(middleware);
        self
    }

    /// Add a middleware that only wraps handlers of message type `T`.
    pub fn middleware_for<T: 'static, M: Middleware>(mut self, middleware: M) -> Self {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        self.requests
            .add_scoped_middleware(TypeId::of::<T>(), middleware.clone());
        self.notifications
            .add_scoped_middleware(TypeId::of::<T>(), middleware);
        self
    }

    /// Run a side effect before the handler of `R`.
    pub fn pre_processor<R, P>(self, processor: P) -> Self
    where
        R: Request,
        P: PreProcessor<R>,
    {
        self.middleware_for::<R, _>(PreProcessorStage::new(processor))
    }

    /// Run a side effect after the handler of `R` has produced its response.
    pub fn post_processor<R, P>(self, processor: P) -> Self
    where
        R: Request,
        P: PostProcessor<R>,
    {
        self.middleware_for::<R, _>(PostProcessorStage::new(processor))
    }

    /// Declare that a handler for `R` must be registered before `build`.
    pub fn require<R: Request>(mut self) -> Self {
        self.required.push((TypeId::of::<R>(), type_name::<R>()));
        self
    }

    /// Validate registrations and freeze the mediator.
    pub fn build(self) -> Result<Mediator, ConfigurationError> {
        if let Some((request, count)) = self.requests.handler_counts().find(|(_, count)| *count > 1) {
            return Err(ConfigurationError::MultipleHandlers { request, count });
        }

        if let Some((_, request)) = self
            .required
            .iter()
            .find(|(type_id, _)| !self.requests.contains(type_id))
        {
            return Err(ConfigurationError::NoHandler(request));
        }

        Ok(Mediator {
            requests: self.requests.build(),
            notifications: self.notifications.build(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Next;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Trace = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct MovePlayer {
        x: i32,
    }

    impl Request for MovePlayer {
        type Response = i32;
    }

    #[derive(Debug)]
    struct Kick;

    impl Request for Kick {
        type Response = ();
    }

    #[derive(Debug)]
    struct PlayerJoined {
        name: String,
    }

    impl Notification for PlayerJoined {}

    struct MoveHandler {
        trace: Trace,
    }

    #[async_trait]
    impl RequestHandler<MovePlayer> for MoveHandler {
        async fn handle(&self, request: &MovePlayer, _cancel: &CancellationToken) -> anyhow::Result<i32> {
            self.trace.lock().unwrap().push("handler".to_string());
            Ok(request.x * 2)
        }
    }

    struct Recorder {
        name: &'static str,
        trace: Trace,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, envelope: &Envelope<'_>, next: Next<'_>) -> DispatchResult<Reply> {
            self.trace.lock().unwrap().push(format!("{}-before", self.name));
            let reply = next.run(envelope).await;
            self.trace.lock().unwrap().push(format!("{}-after", self.name));
            reply
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, _envelope: &Envelope<'_>, _next: Next<'_>) -> DispatchResult<Reply> {
            Ok(Box::new(-1i32))
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("player is frozen")]
    struct Frozen;

    struct FrozenHandler;

    #[async_trait]
    impl RequestHandler<MovePlayer> for FrozenHandler {
        async fn handle(&self, _request: &MovePlayer, _cancel: &CancellationToken) -> anyhow::Result<i32> {
            Err(Frozen.into())
        }
    }

    struct Greeter {
        trace: Trace,
        fail: bool,
    }

    #[async_trait]
    impl NotificationHandler<PlayerJoined> for Greeter {
        async fn handle(&self, notification: &PlayerJoined, _cancel: &CancellationToken) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("greeter broke");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.trace.lock().unwrap().push(format!("hello {}", notification.name));
            Ok(())
        }
    }

    fn trace() -> Trace {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_middleware_nesting_follows_registration_order() {
        let trace = trace();
        let mediator = Mediator::builder()
            .middleware(Recorder { name: "A", trace: trace.clone() })
            .middleware(Recorder { name: "B", trace: trace.clone() })
            .handler(MoveHandler { trace: trace.clone() })
            .build()
            .unwrap();

        assert_eq!(mediator.send(MovePlayer { x: 21 }).await.unwrap(), 42);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["A-before", "B-before", "handler", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let trace = trace();
        let mediator = Mediator::builder()
            .middleware(ShortCircuit)
            .handler(MoveHandler { trace: trace.clone() })
            .build()
            .unwrap();

        assert_eq!(mediator.send(MovePlayer { x: 1 }).await.unwrap(), -1);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_middleware_only_wraps_its_type() {
        let trace = trace();
        let mediator = Mediator::builder()
            .middleware_for::<Kick, _>(ShortCircuit)
            .handler(MoveHandler { trace: trace.clone() })
            .build()
            .unwrap();

        assert_eq!(mediator.send(MovePlayer { x: 2 }).await.unwrap(), 4);
    }

    #[test]
    fn test_duplicate_handlers_fail_at_build() {
        let result = Mediator::builder()
            .handler(MoveHandler { trace: trace() })
            .handler(FrozenHandler)
            .build();

        assert!(matches!(
            result,
            Err(ConfigurationError::MultipleHandlers { count: 2, .. })
        ));
    }

    #[test]
    fn test_required_handler_missing_fails_at_build() {
        let result = Mediator::builder()
            .handler(MoveHandler { trace: trace() })
            .require::<Kick>()
            .build();

        assert_eq!(
            result.err(),
            Some(ConfigurationError::NoHandler(type_name::<Kick>()))
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails_at_send() {
        let mediator = Mediator::builder().build().unwrap();
        let err = mediator.send(Kick).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Configuration(ConfigurationError::NoHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_error_keeps_its_identity() {
        let mediator = Mediator::builder().handler(FrozenHandler).build().unwrap();

        let err = mediator.send(MovePlayer { x: 0 }).await.unwrap_err();
        let source = err.handler_source().unwrap();
        assert!(source.downcast_ref::<Frozen>().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_dispatch() {
        let trace = trace();
        let mediator = Mediator::builder()
            .handler(MoveHandler { trace: trace.clone() })
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = mediator.send_with(MovePlayer { x: 1 }, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_endpoints_reject_foreign_messages() {
        let trace = trace();
        let cancel = CancellationToken::new();
        let stray = MovePlayer { x: 1 };
        let envelope = Envelope::new(&stray, &cancel);

        let greeter = NotificationEndpoint::<PlayerJoined, _> {
            handler: Arc::new(Greeter { trace: trace.clone(), fail: false }),
            _notification: PhantomData,
        };
        match greeter.call(&envelope).await {
            Err(DispatchError::RequestType { request }) => assert_eq!(request, type_name::<MovePlayer>()),
            Err(other) => panic!("Unexpected error: {:?}", other),
            Ok(_) => panic!("a foreign notification was accepted"),
        }
        assert!(trace.lock().unwrap().is_empty());

        let kick = Kick;
        let envelope = Envelope::new(&kick, &cancel);
        let mover = RequestEndpoint::<MovePlayer, _> {
            handler: Arc::new(MoveHandler { trace: trace.clone() }),
            _request: PhantomData,
        };
        assert!(matches!(
            mover.call(&envelope).await,
            Err(DispatchError::RequestType { .. })
        ));
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_isolates_failures() {
        let trace = trace();
        let mediator = Mediator::builder()
            .notification_handler(Greeter { trace: trace.clone(), fail: true })
            .notification_handler(Greeter { trace: trace.clone(), fail: false })
            .build()
            .unwrap();

        let err = mediator
            .publish(PlayerJoined { name: "Alice".to_string() })
            .await
            .unwrap_err();

        assert_eq!(*trace.lock().unwrap(), vec!["hello Alice"]);
        match err {
            DispatchError::Aggregate { total, failures, .. } => {
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].to_string().contains("greeter broke"));
            }
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_runs_each_handler_chain() {
        let trace = trace();
        let mediator = Mediator::builder()
            .middleware(Recorder { name: "M", trace: trace.clone() })
            .notification_handler(Greeter { trace: trace.clone(), fail: false })
            .notification_handler(Greeter { trace: trace.clone(), fail: false })
            .build()
            .unwrap();

        mediator
            .publish(PlayerJoined { name: "Bob".to_string() })
            .await
            .unwrap();

        let trace = trace.lock().unwrap();
        assert_eq!(trace.iter().filter(|e| *e == "M-before").count(), 2);
        assert_eq!(trace.iter().filter(|e| *e == "M-after").count(), 2);
        assert_eq!(trace.iter().filter(|e| *e == "hello Bob").count(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_ok() {
        let mediator = Mediator::builder().build().unwrap();
        mediator
            .publish(PlayerJoined { name: "Nobody".to_string() })
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handler_is_built_once_under_concurrent_first_use() {
        let built = Arc::new(AtomicUsize::new(0));
        let trace = trace();
        let mediator = {
            let built = built.clone();
            let trace = trace.clone();
            Arc::new(
                Mediator::builder()
                    .handler_factory::<MovePlayer, MoveHandler, _>(move || {
                        built.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Arc::new(MoveHandler { trace: trace.clone() })
                    })
                    .build()
                    .unwrap(),
            )
        };

        let tasks: Vec<_> = (0..8)
            .map(|x| {
                let mediator = mediator.clone();
                tokio::spawn(async move { mediator.send(MovePlayer { x }).await.unwrap() })
            })
            .collect();

        for (x, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), x as i32 * 2);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(mediator.requests.cached_types(), 1);
    }
}
