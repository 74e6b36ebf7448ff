// Token endpoint grants (authorization_code and refresh_token)

use reqwest::{Client, StatusCode};

use super::types::{OAuthCredentials, TokenResponse};
use crate::error::AuthError;

/// First 8 characters of a secret, for logs
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

/// Outcome of a single token endpoint call that was answered with a non-200 status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantFailure {
    pub status: u16,
    pub body: String,
}

/// Provider token endpoint
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    client: Client,
    token_url: String,
}

impl TokenEndpoint {
    pub fn new(client: Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
        }
    }

    /// Exchange an authorization code.
    ///
    /// The outer error is a transport or decode failure; the inner one is a
    /// provider rejection, which the callback listener retries.
    pub async fn exchange_code(
        &self,
        creds: &OAuthCredentials,
        redirect_uri: &str,
        code: &str,
    ) -> Result<Result<TokenResponse, GrantFailure>, AuthError> {
        tracing::info!("Exchanging authorization code for tokens...");

        let form = [
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("scope", creds.scope.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];

        self.post_grant(&form).await
    }

    /// Redeem the refresh token held in `creds`
    pub async fn refresh(&self, creds: &OAuthCredentials) -> Result<TokenResponse, AuthError> {
        let refresh_token = match creds.refresh_token() {
            Some(token) if !creds.client_id.is_empty() && !creds.client_secret.is_empty() => token,
            _ => return Err(AuthError::MissingRefreshParameters),
        };

        tracing::info!(
            "Refreshing access token (refresh_token={}...)",
            token_prefix(refresh_token)
        );

        let form = [
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("scope", creds.scope.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        match self.post_grant(&form).await? {
            Ok(response) => Ok(response),
            Err(GrantFailure { status, body }) => Err(AuthError::RefreshRejected { status, body }),
        }
    }

    async fn post_grant(
        &self,
        form: &[(&str, &str)],
    ) -> Result<Result<TokenResponse, GrantFailure>, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            tracing::error!(
                status = status.as_u16(),
                "Token endpoint rejected the grant: {}",
                body
            );

            // Surface the provider's error code when it sent one
            if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(&body) {
                if let (Some(error_code), Some(error_desc)) = (
                    error_json.get("error").and_then(|v| v.as_str()),
                    error_json.get("error_description").and_then(|v| v.as_str()),
                ) {
                    tracing::error!(
                        "Token endpoint error details: error={}, description={}",
                        error_code,
                        error_desc
                    );
                }
            }

            return Ok(Err(GrantFailure {
                status: status.as_u16(),
                body,
            }));
        }

        let raw: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedTokenResponse(e.to_string()))?;
        let mut parsed: TokenResponse = serde_json::from_value(raw.clone())
            .map_err(|e| AuthError::MalformedTokenResponse(e.to_string()))?;
        parsed.raw = raw;

        tracing::debug!(
            token_type = parsed.token_type.as_deref().unwrap_or("-"),
            expires_in = parsed.expires_in.unwrap_or_default(),
            "Token endpoint returned 200"
        );

        Ok(Ok(parsed))
    }
}
