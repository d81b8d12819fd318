//! OAuth2 token state and the merge rules applied on refresh.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub scope: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// A token is usable only while `now + margin` is strictly before `expires_at`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }

    pub fn is_usable(&self, margin: Duration) -> bool {
        self.is_usable_at(Utc::now(), margin)
    }

    pub fn authorization_value(&self) -> String {
        let kind = if self.token_type.is_empty() {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{kind} {}", self.access_token)
    }

    /// Applies a refresh response on top of this token. Fields the response
    /// leaves empty keep their previous value.
    pub fn merge(&self, grant: TokenGrant, now: DateTime<Utc>) -> AccessToken {
        let expires_at = match grant.expires_in {
            Some(secs) if secs > 0 => expiry(now, secs),
            _ => self.expires_at,
        };
        AccessToken {
            access_token: keep_non_empty(grant.access_token, &self.access_token),
            token_type: keep_non_empty(grant.token_type, &self.token_type),
            scope: keep_non_empty(grant.scope, &self.scope),
            refresh_token: keep_non_empty(grant.refresh_token, &self.refresh_token),
            expires_at,
        }
    }
}

/// Expiry instants are kept at millisecond precision, the resolution they
/// are stored at.
fn expiry(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    (now + Duration::seconds(expires_in)).trunc_subsecs(3)
}

fn keep_non_empty(new: Option<String>, old: &str) -> String {
    match new {
        Some(value) if !value.is_empty() => value,
        _ => old.to_string(),
    }
}

/// Token endpoint response body, shared by the password and OAuth2 grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenGrant {
    pub fn into_token(self, now: DateTime<Utc>) -> AccessToken {
        AccessToken {
            access_token: self.access_token.unwrap_or_default(),
            token_type: self.token_type.unwrap_or_default(),
            scope: self.scope.unwrap_or_default(),
            refresh_token: self.refresh_token.unwrap_or_default(),
            expires_at: expiry(now, self.expires_in.unwrap_or(0).max(0)),
        }
    }
}
