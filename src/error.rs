use crate::config::ConfigError;
use crate::types::ValueEncoding;
use thiserror::Error;

/// Result type for transport operations
pub type LslResult<T> = Result<T, LslError>;

/// Errors that can occur while describing, resolving or moving streams
#[derive(Debug, Error)]
pub enum LslError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Sample has {actual} values but the stream has {expected} channels")]
    SampleShape { expected: usize, actual: usize },

    #[error("Type mismatch: stream carries {expected} values, got {actual}")]
    TypeMismatch {
        expected: ValueEncoding,
        actual: ValueEncoding,
    },

    #[error("Invalid predicate at offset {position}: {message}")]
    Predicate { position: usize, message: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Resource error ({context}): {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Endpoint closed")]
    Closed,
}

impl LslError {
    /// Errors caused by the caller's own arguments. These are reported at the
    /// offending call and never retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            LslError::Configuration(_)
                | LslError::Config(_)
                | LslError::SampleShape { .. }
                | LslError::TypeMismatch { .. }
                | LslError::Predicate { .. }
        )
    }

    pub(crate) fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        LslError::Resource {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_taxonomy() {
        assert!(LslError::SampleShape {
            expected: 1,
            actual: 2
        }
        .is_configuration_error());
        assert!(LslError::TypeMismatch {
            expected: ValueEncoding::String,
            actual: ValueEncoding::Float32,
        }
        .is_configuration_error());
        assert!(LslError::Configuration("bad".to_string()).is_configuration_error());

        assert!(!LslError::ConnectionLost("gone".to_string()).is_configuration_error());
        assert!(!LslError::Cancelled.is_configuration_error());
    }

    #[test]
    fn test_messages() {
        let err = LslError::SampleShape {
            expected: 8,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Sample has 3 values but the stream has 8 channels"
        );

        let err = LslError::TypeMismatch {
            expected: ValueEncoding::String,
            actual: ValueEncoding::Float32,
        };
        assert_eq!(
            err.to_string(),
            "Type mismatch: stream carries string values, got float32"
        );
    }
}
