// Authorization-code acquisition: authorization URL and the browser round trip

use reqwest::Url;

use super::callback::{AcquiredToken, CallbackContext, CallbackListener};
use super::token_endpoint::TokenEndpoint;
use super::types::OAuthCredentials;
use crate::config::Config;
use crate::error::AuthError;
use crate::http_client::build_client;

/// Parameters of one authorization request; `state` is fresh per instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub authorize_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub response_mode: String,
    pub prompt: String,
}

impl AuthorizationRequest {
    pub fn new(config: &Config) -> Self {
        Self {
            authorize_url: config.authorize_url(),
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scope: config.scope.clone(),
            state: uuid::Uuid::new_v4().to_string(),
            response_mode: "query".to_string(),
            prompt: "login".to_string(),
        }
    }

    /// Provider URL the user is sent to.
    ///
    /// `max_age=0` forces the provider to re-authenticate instead of reusing
    /// an existing browser session.
    pub fn url(&self) -> Result<Url, AuthError> {
        Url::parse_with_params(
            &self.authorize_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_mode", self.response_mode.as_str()),
                ("scope", self.scope.as_str()),
                ("prompt", self.prompt.as_str()),
                ("state", self.state.as_str()),
                ("max_age", "0"),
            ],
        )
        .map_err(|e| {
            AuthError::Configuration(crate::error::ConfigError::Invalid {
                var: "BASE_URL",
                value: format!("{} ({})", self.authorize_url, e),
            })
        })
    }
}

/// Run the authorization-code flow end to end.
///
/// Binds the callback listener on the configured host/port, hands the
/// authorization URL to `browser` and waits for the single redirect.
pub async fn start_flow<F>(config: &Config, browser: F) -> Result<OAuthCredentials, AuthError>
where
    F: FnOnce(&str),
{
    let listener = CallbackListener::bind(&config.callback_addr()).await?;
    run_flow(config, listener, browser).await
}

/// Same as [`start_flow`] with an already bound listener
pub async fn run_flow<F>(
    config: &Config,
    listener: CallbackListener,
    browser: F,
) -> Result<OAuthCredentials, AuthError>
where
    F: FnOnce(&str),
{
    let request = AuthorizationRequest::new(config);
    let url = request.url()?;

    let context = CallbackContext {
        endpoint: TokenEndpoint::new(build_client(config)?, &config.token_url),
        credentials: OAuthCredentials::unauthenticated(config),
        redirect_uri: request.redirect_uri.clone(),
        expected_state: request.state.clone(),
    };
    let server = listener.serve(context);

    tracing::info!("Waiting for the authorization redirect on {}", config.redirect_uri);
    browser(url.as_str());

    let AcquiredToken {
        credentials,
        response,
    } = server.wait().await?;

    if config.add_token_response_to_file {
        write_token_response(config, &response.raw)?;
    }

    tracing::info!("Authorization complete for client {}", credentials.client_id);
    Ok(credentials)
}

/// Diagnostic dump of the raw token endpoint response
fn write_token_response(config: &Config, raw: &serde_json::Value) -> Result<(), AuthError> {
    let body = serde_json::to_vec_pretty(raw).map_err(crate::error::StoreError::from)?;
    std::fs::write(&config.token_response_file, body)?;
    tracing::info!(
        "Token response written to {}",
        config.token_response_file.display()
    );
    Ok(())
}
