use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::fetch::FetchError;
use super::store::StoreError;

/// Failure of a sync or query.
///
/// Clones share the underlying store error, so every waiter coalesced onto a
/// job observes the same value.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("transient fetch error after {attempts} attempts: {message}")]
    TransientFetch { attempts: u32, message: String },
    #[error("permanent fetch error: {0}")]
    PermanentFetch(String),
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("sync did not finish within {0:?}")]
    SyncTimeout(Duration),
    #[error("store error: {0}")]
    Store(Arc<StoreError>),
    #[error("sync engine is shutting down")]
    ShuttingDown,
    #[error("unknown stream: {0}")]
    UnknownStream(String),
}

impl SyncError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientFetch { .. } | SyncError::SyncTimeout(_) | SyncError::ShuttingDown
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(Arc::new(err))
    }
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient { attempts, message } => {
                SyncError::TransientFetch { attempts, message }
            }
            FetchError::Permanent(message) => SyncError::PermanentFetch(message),
        }
    }
}
