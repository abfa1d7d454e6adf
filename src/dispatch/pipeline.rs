//! Middleware chains and the per-type pipeline cache shared by the mediator
//! and the query dispatcher.

use async_trait::async_trait;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use super::error::DispatchResult;
use crate::cancel::CancellationToken;

/// Type-erased handler output travelling back up the chain.
pub type Reply = Box<dyn Any + Send + Sync>;

/// Anything that can travel through a pipeline.
pub trait AnyMessage: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn as_debug(&self) -> &dyn Debug;
}

impl<T: Debug + Send + Sync + 'static> AnyMessage for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_debug(&self) -> &dyn Debug {
        self
    }
}

/// A request, query or notification on its way through the chain.
pub struct Envelope<'a> {
    message: &'a dyn AnyMessage,
    type_name: &'static str,
    cancel: &'a CancellationToken,
}

impl<'a> Envelope<'a> {
    pub fn new<T: AnyMessage + 'static>(
        message: &'a T,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            message,
            type_name: std::any::type_name::<T>(),
            cancel,
        }
    }

    /// Fully qualified type name of the message
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Debug view of the message, used for logging
    pub fn message(&self) -> &dyn Debug {
        self.message.as_debug()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&'a T> {
        self.message.as_any().downcast_ref::<T>()
    }

    pub fn cancellation(&self) -> &'a CancellationToken {
        self.cancel
    }
}

/// One stage of a pipeline.
///
/// A stage receives the message and the rest of the chain. It decides
/// whether to call `next`, and may act before and after it.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, envelope: &Envelope<'_>, next: Next<'_>) -> DispatchResult<Reply>;
}

/// The innermost link: a type-specific handler behind an erased interface.
#[async_trait]
pub(crate) trait Endpoint: Send + Sync {
    async fn call(&self, envelope: &Envelope<'_>) -> DispatchResult<Reply>;
}

/// The remainder of a chain, handed to each middleware.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// Run the remaining stages and the handler.
    pub async fn run(self, envelope: &Envelope<'_>) -> DispatchResult<Reply> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    endpoint: self.endpoint,
                };
                stage.handle(envelope, next).await
            }
            None => self.endpoint.call(envelope).await,
        }
    }
}

/// A compiled chain: middlewares outermost-first around one handler.
pub(crate) struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn Endpoint>,
}

impl Pipeline {
    pub(crate) async fn invoke(&self, envelope: &Envelope<'_>) -> DispatchResult<Reply> {
        let next = Next {
            stages: &self.stages,
            endpoint: self.endpoint.as_ref(),
        };
        next.run(envelope).await
    }
}

pub(crate) type EndpointFactory = Box<dyn Fn() -> Arc<dyn Endpoint> + Send + Sync>;

struct Registration {
    type_name: &'static str,
    factories: Vec<EndpointFactory>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    Only(TypeId),
}

/// Collects handlers and middlewares before a table is frozen.
#[derive(Default)]
pub(crate) struct TableBuilder {
    registrations: HashMap<TypeId, Registration>,
    middleware: Vec<(Scope, Arc<dyn Middleware>)>,
}

impl TableBuilder {
    pub(crate) fn add_handler(
        &mut self,
        type_id: TypeId,
        type_name: &'static str,
        factory: EndpointFactory,
    ) {
        self.registrations
            .entry(type_id)
            .or_insert_with(|| Registration {
                type_name,
                factories: Vec::new(),
            })
            .factories
            .push(factory);
    }

    pub(crate) fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push((Scope::All, middleware));
    }

    pub(crate) fn add_scoped_middleware(&mut self, type_id: TypeId, middleware: Arc<dyn Middleware>) {
        self.middleware.push((Scope::Only(type_id), middleware));
    }

    /// Handler count per registered type.
    pub(crate) fn handler_counts(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.registrations
            .values()
            .map(|r| (r.type_name, r.factories.len()))
    }

    pub(crate) fn contains(&self, type_id: &TypeId) -> bool {
        self.registrations.contains_key(type_id)
    }

    pub(crate) fn build(self) -> PipelineTable {
        PipelineTable {
            registrations: self.registrations,
            middleware: self.middleware,
            cache: DashMap::new(),
        }
    }
}

/// Frozen registrations plus the lazily filled per-type pipeline cache.
pub(crate) struct PipelineTable {
    registrations: HashMap<TypeId, Registration>,
    middleware: Vec<(Scope, Arc<dyn Middleware>)>,
    cache: DashMap<TypeId, Arc<Vec<Pipeline>>>,
}

impl PipelineTable {
    /// Pipelines for a type, one per registered handler.
    ///
    /// The first call for a type builds the handlers and chains while holding
    /// the cache shard lock, so racing callers share a single construction.
    /// Handler factories must not dispatch through the same table.
    pub(crate) fn resolve(&self, type_id: TypeId) -> Option<Arc<Vec<Pipeline>>> {
        if let Some(cached) = self.cache.get(&type_id) {
            return Some(cached.value().clone());
        }

        let registration = self.registrations.get(&type_id)?;
        let entry = self.cache.entry(type_id).or_insert_with(|| {
            tracing::debug!("Building pipeline for {}", registration.type_name);
            let stages = self.chain_for(type_id);
            let pipelines = registration
                .factories
                .iter()
                .map(|factory| Pipeline {
                    stages: stages.clone(),
                    endpoint: factory(),
                })
                .collect();
            Arc::new(pipelines)
        });

        Some(entry.value().clone())
    }

    fn chain_for(&self, type_id: TypeId) -> Vec<Arc<dyn Middleware>> {
        self.middleware
            .iter()
            .filter(|(scope, _)| match scope {
                Scope::All => true,
                Scope::Only(id) => *id == type_id,
            })
            .map(|(_, middleware)| middleware.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn cached_types(&self) -> usize {
        self.cache.len()
    }
}
