/// Result type alias for memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the HTM memory engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate content: an active node already has hash {0}")]
    DuplicateContent(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Embedding dimension {got} exceeds storage width {width}")]
    EmbeddingDimension { got: usize, width: usize },

    #[error("Tag extraction error: {0}")]
    TagExtraction(String),

    #[error("Circuit breaker open")]
    CircuitBreakerOpen,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Storage(_) => true,
            Error::Embedding(_) => true,
            Error::TagExtraction(_) => true,
            Error::Timeout(_) => true,
            Error::CircuitBreakerOpen => true,
            Error::Io(_) => true,
            Error::Validation(_) => false,
            Error::NotFound(_) => false,
            Error::DuplicateContent(_) => false,
            Error::EmbeddingDimension { .. } => false,
            Error::Configuration(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Shorthand for a `NotFound` error about a node id.
    pub fn node_not_found(id: i64) -> Self {
        Error::NotFound(format!("node {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::Storage("connection reset".into()).is_recoverable());
        assert!(Error::Timeout(std::time::Duration::from_secs(30)).is_recoverable());
        assert!(!Error::Validation("empty content".into()).is_recoverable());
        assert!(!Error::DuplicateContent("abc".into()).is_recoverable());
    }

    #[test]
    fn display_messages() {
        let err = Error::EmbeddingDimension {
            got: 3072,
            width: 2000,
        };
        assert_eq!(
            err.to_string(),
            "Embedding dimension 3072 exceeds storage width 2000"
        );
        assert_eq!(Error::node_not_found(7).to_string(), "Not found: node 7");
    }
}
