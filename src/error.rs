use std::sync::Arc;

/// Error type accepted from fetch functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by [`Cache`](crate::Cache) and [`Flights`](crate::Flights).
///
/// The error is cheap to clone so that a single fetch failure can be handed
/// to every caller that waited on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The fetch function failed. Displays as the original error.
    #[error(transparent)]
    Fetch(Arc<dyn std::error::Error + Send + Sync>),

    /// The fetch ended without producing an outcome, e.g. because it panicked
    /// or the runtime shut down underneath it.
    #[error("fetch was abandoned before producing a result")]
    Abandoned,
}

impl Error {
    pub(crate) fn fetch(err: impl Into<BoxError>) -> Self {
        Self::Fetch(Arc::from(err.into()))
    }

    /// Returns the original fetch error if it is of type `T`.
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        match self {
            Self::Fetch(err) => err.downcast_ref::<T>(),
            Self::Abandoned => None,
        }
    }
}
