//! Error taxonomy shared by the retrieval pipeline and the ingestion path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage that produced an upstream failure or observed cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embedding,
    VectorCollection,
    VectorUpsert,
    VectorSearch,
    Completion,
    MessageBus,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Embedding => "embedding",
            Stage::VectorCollection => "vector_collection",
            Stage::VectorUpsert => "vector_upsert",
            Stage::VectorSearch => "vector_search",
            Stage::Completion => "completion",
            Stage::MessageBus => "message_bus",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the core
///
/// Upstream failures are never retried inside the core; the first failure of a
/// multi-stage operation is returned with its stage attached.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgriError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{stage} failed: {message}")]
    Upstream { stage: Stage, message: String },

    #[error("malformed telemetry payload: {0}")]
    Deserialization(String),

    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },

    #[error("batch item {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<AgriError>,
    },
}

/// Stable, machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    UpstreamError,
    DeserializationError,
    CancellationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::DeserializationError => "deserialization_error",
            ErrorKind::CancellationError => "cancellation_error",
        }
    }
}

impl AgriError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(stage: Stage, message: impl Into<String>) -> Self {
        Self::Upstream {
            stage,
            message: message.into(),
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::Cancelled { stage }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Upstream { .. } => ErrorKind::UpstreamError,
            Self::Deserialization(_) => ErrorKind::DeserializationError,
            Self::Cancelled { .. } => ErrorKind::CancellationError,
            Self::Batch { source, .. } => source.kind(),
        }
    }

    /// Stage the failure originated from, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Upstream { stage, .. } | Self::Cancelled { stage } => Some(*stage),
            Self::Batch { source, .. } => source.stage(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::CancellationError
    }
}

pub type AgriResult<T> = std::result::Result<T, AgriError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(
            AgriError::validation("empty query").kind().as_str(),
            "validation_error"
        );
        assert_eq!(
            AgriError::upstream(Stage::Completion, "HTTP 500").kind().as_str(),
            "upstream_error"
        );
        assert_eq!(
            AgriError::cancelled(Stage::VectorSearch).kind().as_str(),
            "cancellation_error"
        );
    }

    #[test]
    fn test_batch_delegates_to_source() {
        let err = AgriError::Batch {
            index: 3,
            source: Box::new(AgriError::cancelled(Stage::Embedding)),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.stage(), Some(Stage::Embedding));
        assert!(err.to_string().contains("batch item 3"));
    }

    #[test]
    fn test_display_names_stage() {
        let err = AgriError::upstream(Stage::Embedding, "no embedding returned");
        assert_eq!(err.to_string(), "embedding failed: no embedding returned");
    }
}
