//! Dispatch error taxonomy.

use thiserror::Error;

/// Wiring defects: a request or query type without exactly one handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No handler registered for {0}")]
    NoHandler(&'static str),

    #[error("{count} handlers registered for {request}, expected exactly one")]
    MultipleHandlers { request: &'static str, count: usize },
}

/// Errors surfaced by `send`, `publish` and `dispatch`
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A handler, pre-processor or post-processor returned an error.
    /// The original error is kept as the source.
    #[error("Handler for {request} failed: {source}")]
    Handler {
        request: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Handler for {request} panicked: {message}")]
    Panicked {
        request: &'static str,
        message: String,
    },

    #[error("{request} was cancelled")]
    Cancelled { request: &'static str },

    /// A handler was handed a message of a type it does not handle.
    #[error("Handler received {request}, which is not the message type it handles")]
    RequestType { request: &'static str },

    #[error("Handler for {request} produced an unexpected response type")]
    ResponseType { request: &'static str },

    #[error("{} of {total} handlers for {notification} failed", .failures.len())]
    Aggregate {
        notification: &'static str,
        total: usize,
        failures: Vec<DispatchError>,
    },
}

impl DispatchError {
    pub fn handler(request: &'static str, source: anyhow::Error) -> Self {
        DispatchError::Handler { request, source }
    }

    /// The original handler error, if this is a handler failure.
    pub fn handler_source(&self) -> Option<&anyhow::Error> {
        match self {
            DispatchError::Handler { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled { .. })
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
