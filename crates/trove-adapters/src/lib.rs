//! Provider fetchers: password-grant saved posts, OAuth2 listen history and
//! the unauthenticated review listing.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use trove_core::{Provider, TokenGrant};
use trove_storage::FetchError;

pub mod listens;
pub mod reviews;
pub mod saved;

pub use listens::{ListensClient, SpotifyEndpoints};
pub use reviews::{extract_cards, ReviewsClient};
pub use saved::{RedditEndpoints, SavedPostsClient, Session};

pub const CRATE_NAME: &str = "trove-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{provider} rejected credentials: {message}")]
    Auth { provider: Provider, message: String },
    #[error("{provider} returned status {status}: {body}")]
    Status {
        provider: Provider,
        status: u16,
        body: String,
    },
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: Provider,
        #[source]
        source: FetchError,
    },
    #[error("{provider} issued an unusable token: {message}")]
    Grant { provider: Provider, message: String },
    #[error("access token expired")]
    TokenExpired,
    #[error("invalid selector `{0}`")]
    Selector(String),
}

impl AdapterError {
    pub(crate) fn from_fetch(provider: Provider, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } => AdapterError::Status {
                provider,
                status,
                body,
            },
            source => AdapterError::Transport { provider, source },
        }
    }

    pub(crate) fn build(provider: Provider, err: reqwest::Error) -> Self {
        AdapterError::Transport {
            provider,
            source: FetchError::Request(err),
        }
    }
}

/// Authorization-code / refresh-token exchange against a provider's token endpoint.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    fn provider(&self) -> Provider;
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AdapterError>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AdapterError>;
}

/// Client id/secret plus the resource owner's username and password.
#[derive(Clone, Deserialize)]
pub struct PasswordCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

pub fn load_credentials<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
