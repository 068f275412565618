//! Batch error types.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Outcome error delivered to every participant of a batch.
///
/// `E` is the factory's own error type. It is shared behind an `Arc` so the
/// same failure can be handed to every joined caller.
#[derive(Debug, Error)]
pub enum BatchError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("Invalid coalescing request: {0}")]
    InvalidRequest(&'static str),

    #[error("Batch factory failed: {0}")]
    Factory(#[source] Arc<E>),

    #[error("Batch factory panicked or was aborted")]
    FactoryAborted,

    #[error("Batch factory did not finish within {0:?}")]
    SettleTimeout(Duration),

    #[error("Batch was dropped before it settled")]
    Abandoned,
}

impl<E> Clone for BatchError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::InvalidRequest(reason) => Self::InvalidRequest(reason),
            Self::Factory(err) => Self::Factory(Arc::clone(err)),
            Self::FactoryAborted => Self::FactoryAborted,
            Self::SettleTimeout(after) => Self::SettleTimeout(*after),
            Self::Abandoned => Self::Abandoned,
        }
    }
}

impl<E> BatchError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The factory's error, if that is what failed the batch.
    pub fn factory_error(&self) -> Option<&E> {
        match self {
            Self::Factory(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "The request was malformed.",
            Self::Factory(_) => "The operation failed. Please try again.",
            Self::FactoryAborted => "The operation stopped unexpectedly. Please try again.",
            Self::SettleTimeout(_) => "The operation timed out. Please try again later.",
            Self::Abandoned => "The operation was cancelled.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("upstream down")]
    struct Upstream;

    #[test]
    fn test_factory_error_is_shared() {
        let err: BatchError<Upstream> = BatchError::Factory(Arc::new(Upstream));
        let copy = err.clone();
        assert_eq!(copy.factory_error(), Some(&Upstream));
        assert!(copy.to_string().contains("upstream down"));
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error as _;
        let err: BatchError<Upstream> = BatchError::Factory(Arc::new(Upstream));
        assert!(err.source().is_some());
        assert!(BatchError::<Upstream>::Abandoned.source().is_none());
    }

    #[test]
    fn test_user_messages() {
        let err: BatchError<Upstream> = BatchError::SettleTimeout(Duration::from_secs(1));
        assert!(err.user_message().contains("timed out"));
        assert!(err.factory_error().is_none());
    }
}
