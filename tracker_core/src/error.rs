use std::error::Error as StdError;
use std::sync::Arc;

/// Common error type for `tracker_core`.
///
/// The type is `Clone` because a failed producer is observed by every
/// dependent that awaits it within the same resolve call. Producers and history
/// stores should preserve their underlying error chain via `Error::backend`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Invalid image, instance or scheduler configuration. Never retried by a
    /// later tick: it either prevents the tracker from starting or aborts the
    /// cycle before any producer runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("producer for '{node}' failed")]
    Producer {
        node: String,
        #[source]
        source: Box<Error>,
    },

    #[error("producer for '{node}' timed out after {after_ms}ms")]
    Timeout { node: String, after_ms: u64 },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),

    /// Something escaped an update cycle (including a panic in the cycle task).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    #[tracing::instrument(level = "debug", name = "tracker.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap an error returned by the producer of `node`.
    ///
    /// Errors that already name a node (a failed dependency, a timeout) are
    /// passed through unchanged so the report points at the node that failed.
    pub fn producer(node: impl Into<String>, source: Error) -> Self {
        match source {
            Self::Producer { .. } | Self::Timeout { .. } | Self::Configuration(_) => source,
            other => Self::Producer {
                node: node.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Name of the data node whose producer failed, if any.
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            Self::Producer { node, .. } | Self::Timeout { node, .. } => Some(node),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
