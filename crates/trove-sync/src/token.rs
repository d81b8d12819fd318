use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};
use trove_adapters::{AdapterError, OAuthClient};
use trove_core::{AccessToken, Provider, UserId};
use trove_storage::TokenStore;

use crate::SyncError;

/// Hands out usable access tokens for one OAuth2 provider, refreshing and
/// persisting them when they fall inside the safety margin.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    client: Arc<dyn OAuthClient>,
    margin: Duration,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TokenStore>, client: Arc<dyn OAuthClient>, margin: Duration) -> Self {
        Self { store, client, margin }
    }

    pub fn provider(&self) -> Provider {
        self.client.provider()
    }

    pub async fn ensure_valid(&self, user_id: UserId) -> Result<AccessToken, SyncError> {
        let provider = self.provider();
        let current = self
            .store
            .load_token(user_id, provider)
            .await?
            .ok_or_else(|| SyncError::Auth {
                provider,
                message: format!("no token stored for user {user_id}"),
            })?;

        let now = Utc::now();
        if current.is_usable_at(now, self.margin) {
            return Ok(current);
        }
        if current.refresh_token.is_empty() {
            return Err(SyncError::Auth {
                provider,
                message: "stored token has no refresh token".to_string(),
            });
        }

        let grant = self.client.refresh(&current.refresh_token).await.map_err(|err| {
            warn!(%provider, user_id, error = %err, "token refresh failed");
            SyncError::Provider(err)
        })?;
        let merged = current.merge(grant, Utc::now());
        if !merged.is_usable_at(Utc::now(), self.margin) {
            warn!(%provider, user_id, expires_at = %merged.expires_at, "refreshed token expires inside the safety margin");
            return Err(SyncError::Provider(AdapterError::Grant {
                provider,
                message: format!(
                    "refreshed token expires at {} inside the {}s safety margin",
                    merged.expires_at,
                    self.margin.num_seconds()
                ),
            }));
        }
        self.store.save_token(user_id, provider, &merged).await?;
        info!(%provider, user_id, expires_at = %merged.expires_at, "refreshed access token");
        Ok(merged)
    }

    /// Exchanges an authorization code and stores the resulting token.
    pub async fn bootstrap(&self, user_id: UserId, code: &str) -> Result<AccessToken, SyncError> {
        let provider = self.provider();
        let grant = self.client.exchange_code(code).await?;
        let token = grant.into_token(Utc::now());
        if token.access_token.is_empty() {
            return Err(SyncError::Auth {
                provider,
                message: "token response carried no access token".to_string(),
            });
        }
        self.store.save_token(user_id, provider, &token).await?;
        info!(%provider, user_id, "stored bootstrap token");
        Ok(token)
    }
}
