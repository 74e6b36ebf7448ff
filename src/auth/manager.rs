use reqwest::{Client, StatusCode};
use tokio::sync::{Mutex, MutexGuard};

use super::credentials::CredentialStore;
use super::token_endpoint::{token_prefix, TokenEndpoint};
use super::types::OAuthCredentials;
use crate::config::Config;
use crate::error::AuthError;
use crate::http_client::{build_client, GraphSession};

/// Refreshes allowed while the probe keeps answering 401
pub const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// Lightweight read used to test the bearer token
const PROBE_PATH: &str = "/me/messages";

/// Token lifecycle manager
/// Owns the credential record; probes it against the mailbox API and refreshes on 401
pub struct TokenManager {
    /// Current credentials; held for the whole refresh so two refreshes never race
    credentials: Mutex<OAuthCredentials>,

    /// Token endpoint for refresh grants
    endpoint: TokenEndpoint,

    /// HTTP client for probe requests and the sessions handed out
    client: Client,

    /// Mailbox API root
    graph_api_base: String,

    /// Where refreshed tokens are saved; `None` keeps them in memory only
    store: Option<CredentialStore>,
}

impl TokenManager {
    pub fn new(
        credentials: OAuthCredentials,
        endpoint: TokenEndpoint,
        client: Client,
        graph_api_base: impl Into<String>,
        store: Option<CredentialStore>,
    ) -> Self {
        Self {
            credentials: Mutex::new(credentials),
            endpoint,
            client,
            graph_api_base: graph_api_base.into(),
            store,
        }
    }

    /// Build the manager from configuration.
    ///
    /// The token file wins over the environment when it exists and belongs to
    /// the same client identity.
    pub fn bootstrap(config: &Config) -> Result<Self, AuthError> {
        let client = build_client(config)?;
        let store = CredentialStore::from_config(config);
        let credentials = initial_credentials(config, &store);

        tracing::info!(
            authenticated = credentials.is_authenticated(),
            persist = config.add_token_response_to_file,
            "Token manager initialized"
        );

        Ok(Self::new(
            credentials,
            TokenEndpoint::new(client.clone(), &config.token_url),
            client,
            &config.graph_api_base,
            config.add_token_response_to_file.then_some(store),
        ))
    }

    /// Snapshot of the current credentials
    pub async fn credentials(&self) -> OAuthCredentials {
        self.credentials.lock().await.clone()
    }

    /// Redeem the refresh token.
    ///
    /// On failure the held credentials are left untouched.
    pub async fn refresh(&self) -> Result<OAuthCredentials, AuthError> {
        let mut creds = self.credentials.lock().await;
        self.refresh_locked(&mut creds).await
    }

    /// Refresh only while `rejected` is still the held access token.
    ///
    /// A caller that lost the race for the lock finds the token already
    /// replaced and reuses it instead of redeeming the refresh token again.
    async fn refresh_if_current(&self, rejected: &str) -> Result<(), AuthError> {
        let mut creds = self.credentials.lock().await;
        if creds.access_token() != Some(rejected) {
            tracing::debug!(
                "Access token {}... already replaced, skipping refresh",
                token_prefix(rejected)
            );
            return Ok(());
        }
        self.refresh_locked(&mut creds).await?;
        Ok(())
    }

    async fn refresh_locked(
        &self,
        creds: &mut MutexGuard<'_, OAuthCredentials>,
    ) -> Result<OAuthCredentials, AuthError> {
        let response = self.endpoint.refresh(&**creds).await.map_err(|e| {
            tracing::error!("Token refresh failed: {}", e);
            e
        })?;

        // Providers may not rotate the refresh token
        let updated = creds.with_token_response(&response, creds.refresh_token())?;

        tracing::info!(
            "Token refreshed (access_token={}..., expires_in={})",
            updated.access_token().map(token_prefix).unwrap_or("-"),
            updated
                .expires_in
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string())
        );

        **creds = updated.clone();

        // The new pair is already live; a failed write only loses the on-disk copy
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&updated) {
                tracing::error!(
                    "Refreshed token could not be saved to {}: {}",
                    store.path().display(),
                    e
                );
            }
        }

        Ok(updated)
    }

    /// Session with a bearer token the mailbox API accepts.
    ///
    /// Probes the API; each 401 triggers one refresh, at most
    /// [`MAX_REFRESH_ATTEMPTS`] times. Concurrent callers rejected with the
    /// same token share a single refresh. Any other non-200 answer fails the probe.
    pub async fn get_authenticated_session(
        &self,
        force_refresh: bool,
    ) -> Result<GraphSession, AuthError> {
        if force_refresh {
            tracing::info!("Forced token refresh requested");
            self.refresh().await?;
        }

        let mut refreshes = 0;
        loop {
            let access_token = self
                .credentials
                .lock()
                .await
                .access_token()
                .map(str::to_string)
                .ok_or(AuthError::NotAuthenticated)?;

            let (status, body) = self.probe(&access_token).await?;
            match status {
                StatusCode::OK => {
                    tracing::info!("Mailbox API connection verified");
                    return Ok(GraphSession::new(
                        self.client.clone(),
                        &self.graph_api_base,
                        access_token,
                    ));
                }
                StatusCode::UNAUTHORIZED => {
                    if refreshes >= MAX_REFRESH_ATTEMPTS {
                        tracing::error!(
                            "Access token still rejected after {} refresh attempts",
                            refreshes
                        );
                        return Err(AuthError::TokenRefreshExhausted {
                            attempts: refreshes,
                        });
                    }
                    refreshes += 1;
                    tracing::warn!(
                        attempt = refreshes,
                        "Access token rejected, refreshing ({}/{})",
                        refreshes,
                        MAX_REFRESH_ATTEMPTS
                    );
                    self.refresh_if_current(&access_token).await?;
                }
                other => {
                    tracing::error!(
                        status = other.as_u16(),
                        "Connection probe failed: {}",
                        body
                    );
                    return Err(AuthError::ProbeFailed {
                        status: other.as_u16(),
                        body,
                    });
                }
            }
        }
    }

    async fn probe(&self, access_token: &str) -> Result<(StatusCode, String), AuthError> {
        let url = format!("{}{}", self.graph_api_base.trim_end_matches('/'), PROBE_PATH);
        tracing::debug!(url = %url, "Probing mailbox API");

        let response = self
            .client
            .get(&url)
            .query(&[("$top", "1")])
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }
}

/// Token file credentials when they match the configured identity, else the environment's
fn initial_credentials(config: &Config, store: &CredentialStore) -> OAuthCredentials {
    let from_env = OAuthCredentials::from_config(config);
    if !store.exists() {
        return from_env;
    }

    match store.load() {
        Ok(from_file) if from_file.same_identity(&from_env) && from_file.is_authenticated() => {
            tracing::info!("Using tokens from {}", store.path().display());
            OAuthCredentials {
                tokens: from_file.tokens,
                token_type: from_file.token_type,
                expires_in: from_file.expires_in,
                issued_at: from_file.issued_at,
                ..from_env
            }
        }
        Ok(_) => {
            tracing::warn!(
                "Ignoring {}: no token pair for client {}",
                store.path().display(),
                from_env.client_id
            );
            from_env
        }
        Err(e) => {
            tracing::warn!("Ignoring token file: {}", e);
            from_env
        }
    }
}
