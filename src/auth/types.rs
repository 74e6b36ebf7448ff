// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{Config, PENDING_TOKEN};
use crate::error::AuthError;

/// Access/refresh token pair; both are present or the credentials are unauthenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Complete credential set for one client identity (client_id + tenant)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub scope: String,
    pub tokens: Option<TokenPair>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl OAuthCredentials {
    /// Client identity without any token material
    pub fn unauthenticated(config: &Config) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            tenant_id: config.tenant_id.clone(),
            scope: config.scope.clone(),
            tokens: None,
            token_type: None,
            expires_in: None,
            issued_at: None,
        }
    }

    /// Credentials as supplied by the environment
    pub fn from_config(config: &Config) -> Self {
        // First-run placeholders count as absent
        let is_set = |token: &str| !token.is_empty() && token != PENDING_TOKEN;
        let tokens = match (is_set(config.access_token.as_str()), is_set(config.refresh_token.as_str())) {
            (true, true) => Some(TokenPair {
                access_token: config.access_token.clone(),
                refresh_token: config.refresh_token.clone(),
            }),
            (false, false) => None,
            _ => {
                tracing::warn!("Only one of ACCESS_TOKEN/REFRESH_TOKEN is set, ignoring both");
                None
            }
        };

        Self {
            token_type: config.token_type.clone(),
            expires_in: config.expires_in,
            tokens,
            ..Self::unauthenticated(config)
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.refresh_token.as_str())
    }

    /// Same client identity (client_id + tenant)
    pub fn same_identity(&self, other: &OAuthCredentials) -> bool {
        self.client_id == other.client_id && self.tenant_id == other.tenant_id
    }

    /// Credentials updated from a token endpoint response.
    ///
    /// A response without `refresh_token` keeps `fallback_refresh` when given,
    /// otherwise it is rejected with `MissingRefreshToken`.
    pub fn with_token_response(
        &self,
        response: &TokenResponse,
        fallback_refresh: Option<&str>,
    ) -> Result<Self, AuthError> {
        let access_token = response
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthError::MalformedTokenResponse("response does not contain access_token".to_string())
            })?;

        let refresh_token = response
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| fallback_refresh.map(str::to_string))
            .ok_or(AuthError::MissingRefreshToken)?;

        Ok(Self {
            tokens: Some(TokenPair {
                access_token,
                refresh_token,
            }),
            token_type: response.token_type.clone().or_else(|| self.token_type.clone()),
            expires_in: response.expires_in.or(self.expires_in),
            scope: response.scope.clone().unwrap_or_else(|| self.scope.clone()),
            issued_at: Some(Utc::now()),
            ..self.clone()
        })
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,

    /// Raw JSON body as returned by the provider
    #[serde(skip)]
    pub raw: serde_json::Value,
}

/// On-disk token file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Save time, YYYYMMDDHHMMSS
    pub timestamp: String,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub scope: String,
}

impl PersistedToken {
    pub fn from_credentials(creds: &OAuthCredentials, timestamp: String) -> Self {
        Self {
            access_token: creds.access_token().map(str::to_string),
            refresh_token: creds.refresh_token().map(str::to_string),
            expires_in: creds.expires_in,
            token_type: creds.token_type.clone(),
            timestamp,
            issued_at: creds.issued_at,
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            tenant_id: creds.tenant_id.clone(),
            scope: creds.scope.clone(),
        }
    }

    pub fn into_credentials(self) -> OAuthCredentials {
        let tokens = match (self.access_token, self.refresh_token) {
            (Some(access_token), Some(refresh_token))
                if !access_token.is_empty() && !refresh_token.is_empty() =>
            {
                Some(TokenPair {
                    access_token,
                    refresh_token,
                })
            }
            _ => None,
        };

        OAuthCredentials {
            client_id: self.client_id,
            client_secret: self.client_secret,
            tenant_id: self.tenant_id,
            scope: self.scope,
            tokens,
            token_type: self.token_type,
            expires_in: self.expires_in,
            issued_at: self.issued_at,
        }
    }
}

/// Snapshot of a superseded token file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenArchiveEntry {
    pub path: PathBuf,
    pub timestamp: String,
}
