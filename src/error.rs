use std::path::PathBuf;

use thiserror::Error;

use crate::metrics::MetricKind;

/// Errors produced while loading images or computing similarity scores
#[derive(Debug, Error)]
pub enum SimilarityError {
    /// A referenced image path does not exist
    #[error("image not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but could not be decoded into an image
    #[error("failed to decode image {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A single comparator could not produce a score for its input
    #[error("{metric} metric failed: {reason}")]
    MetricComputation { metric: MetricKind, reason: String },

    /// Invocation-level argument or JSON errors
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimilarityError {
    pub fn metric(metric: MetricKind, reason: impl Into<String>) -> Self {
        SimilarityError::MetricComputation {
            metric,
            reason: reason.into(),
        }
    }

    /// Whether the pair can still be reported with a zero score
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SimilarityError::NotFound(_)
                | SimilarityError::Decode { .. }
                | SimilarityError::MetricComputation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SimilarityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_level_errors_are_recoverable() {
        assert!(SimilarityError::NotFound(PathBuf::from("a.jpg")).is_recoverable());
        assert!(SimilarityError::metric(MetricKind::Template, "too large").is_recoverable());
        assert!(!SimilarityError::MalformedRequest("empty".into()).is_recoverable());
        assert!(!SimilarityError::Config("weights".into()).is_recoverable());
    }

    #[test]
    fn messages_name_the_metric_and_path() {
        let err = SimilarityError::metric(MetricKind::Structural, "dimension mismatch");
        assert_eq!(err.to_string(), "structural metric failed: dimension mismatch");
        let err = SimilarityError::NotFound(PathBuf::from("/tmp/x.png"));
        assert_eq!(err.to_string(), "image not found: /tmp/x.png");
    }
}
