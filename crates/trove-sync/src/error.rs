use thiserror::Error;
use trove_adapters::AdapterError;
use trove_core::Provider;
use trove_storage::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{provider} authorization failed: {message}")]
    Auth { provider: Provider, message: String },
    #[error(transparent)]
    Provider(AdapterError),
    #[error("access token expired; refresh before retrying")]
    TokenExpired,
    #[error("persistence failed: {0}")]
    Persistence(#[source] StoreError),
    #[error("invalid item: {0}")]
    InvalidItem(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("worker failed: {0}")]
    Worker(String),
}

impl SyncError {
    pub(crate) fn not_configured(provider: Provider) -> Self {
        SyncError::Auth {
            provider,
            message: "no credentials configured".to_string(),
        }
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::TokenExpired => SyncError::TokenExpired,
            AdapterError::Auth { provider, message } => SyncError::Auth { provider, message },
            other => SyncError::Provider(other),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoArtist { track_id } => {
                SyncError::InvalidItem(format!("track {track_id} has no credited artist"))
            }
            StoreError::InvalidQuery(query) => SyncError::InvalidRequest(format!("{query:?}")),
            other => SyncError::Persistence(other),
        }
    }
}
