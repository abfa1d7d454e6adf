//! Read-side dispatch path.
//!
//! Queries get their own middleware chain and handler cache so that read
//! traffic never shares stages or cache entries with commands.

use async_trait::async_trait;
use std::any::{type_name, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use super::error::{ConfigurationError, DispatchError, DispatchResult};
use super::pipeline::{Endpoint, Envelope, Middleware, PipelineTable, Reply, TableBuilder};
use super::{Query, QueryHandler};
use crate::cancel::CancellationToken;

struct QueryEndpoint<Q, H> {
    handler: Arc<H>,
    _query: PhantomData<fn(Q)>,
}

#[async_trait]
impl<Q, H> Endpoint for QueryEndpoint<Q, H>
where
    Q: Query,
    H: QueryHandler<Q>,
{
    async fn call(&self, envelope: &Envelope<'_>) -> DispatchResult<Reply> {
        let query = envelope
            .downcast_ref::<Q>()
            .ok_or(DispatchError::RequestType {
                request: envelope.type_name(),
            })?;
        let output = self
            .handler
            .handle(query, envelope.cancellation())
            .await
            .map_err(|source| DispatchError::handler(envelope.type_name(), source))?;
        Ok(Box::new(output))
    }
}

/// Dispatches queries to their handler through the query middleware chain.
pub struct QueryDispatcher {
    table: PipelineTable,
}

impl QueryDispatcher {
    pub fn builder() -> QueryDispatcherBuilder {
        QueryDispatcherBuilder::default()
    }

    pub async fn dispatch<Q: Query>(&self, query: Q) -> DispatchResult<Q::Output> {
        self.dispatch_with(query, &CancellationToken::new()).await
    }

    pub async fn dispatch_with<Q: Query>(
        &self,
        query: Q,
        cancel: &CancellationToken,
    ) -> DispatchResult<Q::Output> {
        let query_name = type_name::<Q>();
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled {
                request: query_name,
            });
        }

        let pipelines = self
            .table
            .resolve(TypeId::of::<Q>())
            .ok_or(ConfigurationError::NoHandler(query_name))?;
        let [pipeline] = pipelines.as_slice() else {
            return Err(ConfigurationError::MultipleHandlers {
                request: query_name,
                count: pipelines.len(),
            }
            .into());
        };

        let envelope = Envelope::new(&query, cancel);
        let reply = pipeline.invoke(&envelope).await?;

        reply
            .downcast::<Q::Output>()
            .map(|output| *output)
            .map_err(|_| DispatchError::ResponseType {
                request: query_name,
            })
    }
}

/// Collects query handlers and middlewares for a [`QueryDispatcher`].
#[derive(Default)]
pub struct QueryDispatcherBuilder {
    table: TableBuilder,
    required: Vec<(TypeId, &'static str)>,
}

impl QueryDispatcherBuilder {
    pub fn handler<Q, H>(self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        let handler = Arc::new(handler);
        self.handler_factory::<Q, H, _>(move || handler.clone())
    }

    /// Register a handler constructed on the first dispatch of `Q`.
    pub fn handler_factory<Q, H, F>(mut self, factory: F) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
        F: Fn() -> Arc<H> + Send + Sync + 'static,
    {
        self.table.add_handler(
            TypeId::of::<Q>(),
            type_name::<Q>(),
            Box::new(move || {
                Arc::new(QueryEndpoint::<Q, H> {
                    handler: factory(),
                    _query: PhantomData,
                }) as Arc<dyn Endpoint>
            }),
        );
        self
    }

    pub fn middleware<M: Middleware>(self, middleware: M) -> Self {
        self.shared_middleware(Arc::new(middleware))
    }

    pub fn shared_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.table.add_middleware(middleware);
        self
    }

    pub fn middleware_for<Q: Query, M: Middleware>(mut self, middleware: M) -> Self {
        self.table
            .add_scoped_middleware(TypeId::of::<Q>(), Arc::new(middleware));
        self
    }

    pub fn require<Q: Query>(mut self) -> Self {
        self.required.push((TypeId::of::<Q>(), type_name::<Q>()));
        self
    }

    pub fn build(self) -> Result<QueryDispatcher, ConfigurationError> {
        if let Some((request, count)) = self.table.handler_counts().find(|(_, count)| *count > 1) {
            return Err(ConfigurationError::MultipleHandlers { request, count });
        }

        if let Some((_, query)) = self
            .required
            .iter()
            .find(|(type_id, _)| !self.table.contains(type_id))
        {
            return Err(ConfigurationError::NoHandler(query));
        }

        Ok(QueryDispatcher {
            table: self.table.build(),
        })
    }
}
