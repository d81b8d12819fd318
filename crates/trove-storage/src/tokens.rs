use async_trait::async_trait;
use chrono::Utc;
use trove_core::{AccessToken, Provider, UserId};

use crate::{from_millis, Database, StoreError, TokenStore};

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    access_token: String,
    token_type: String,
    scope: String,
    refresh_token: String,
    expires_at: i64,
}

#[async_trait]
impl TokenStore for Database {
    async fn load_token(&self, user_id: UserId, provider: Provider) -> Result<Option<AccessToken>, StoreError> {
        let row: Option<TokenRow> = sqlx::query_as(
            r#"
            SELECT access_token, token_type, scope, refresh_token, expires_at
              FROM provider_tokens
             WHERE user_id = ? AND provider = ?
            "#,
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(AccessToken {
                access_token: row.access_token,
                token_type: row.token_type,
                scope: row.scope,
                refresh_token: row.refresh_token,
                expires_at: from_millis(row.expires_at)?,
            })
        })
        .transpose()
    }

    async fn save_token(&self, user_id: UserId, provider: Provider, token: &AccessToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO provider_tokens
                (user_id, provider, access_token, token_type, scope, refresh_token, expires_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                token_type = excluded.token_type,
                scope = excluded.scope,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(&token.access_token)
        .bind(&token.token_type)
        .bind(&token.scope)
        .bind(&token.refresh_token)
        .bind(token.expires_at.timestamp_millis())
        .bind(Utc::now().timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
