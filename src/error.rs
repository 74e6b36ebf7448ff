// Error handling module
// Defines the error taxonomy shared by the token lifecycle and the mailbox client

use axum::http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Startup configuration errors (always fatal)
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable missing or empty
    #[error("Environment variable {0} is not set")]
    MissingVar(&'static str),

    /// Variable present but not parseable
    #[error("Environment variable {var} has an invalid value: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Credential store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Token files must be JSON documents
    #[error("Token file is not in the JSON format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Token file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Token file has no access/refresh token pair
    #[error("Token file has no token pair: {}", .0.display())]
    MissingTokens(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid token file JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while acquiring, validating or refreshing credentials
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Redirect arrived without `code` or `state`
    #[error("Missing 'code' or 'state' in the query parameters")]
    MissingCallbackParameters,

    /// Redirect carried a `state` that was not issued for this flow
    #[error("State mismatch: expected {expected}, received {received}")]
    StateMismatch { expected: String, received: String },

    /// Token exchange succeeded but the provider did not return a refresh token
    #[error("No refresh token found in the token response")]
    MissingRefreshToken,

    /// Refresh needs refresh_token, client_id and client_secret
    #[error("Missing parameters for token refresh")]
    MissingRefreshParameters,

    #[error("Malformed token response: {0}")]
    MalformedTokenResponse(String),

    /// No token pair held, the authorization flow has to run first
    #[error("No access token available, run the login flow first")]
    NotAuthenticated,

    #[error("Token request failed: {status} - {body}")]
    ExchangeRejected { status: u16, body: String },

    #[error("Token refresh failed: {status} - {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("Access token expired and could not be refreshed after {attempts} attempts")]
    TokenRefreshExhausted { attempts: u32 },

    /// Connectivity probe failed for a reason other than authentication
    #[error("Connection failed with status code {status}: {body}")]
    ProbeFailed { status: u16, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    /// Status code reported to the browser on the callback page
    pub fn http_status(&self) -> StatusCode {
        match self {
            AuthError::MissingCallbackParameters | AuthError::StateMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            AuthError::ExchangeRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AuthError::MissingRefreshToken
            | AuthError::MalformedTokenResponse(_)
            | AuthError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure can only be cleared by running the authorization flow again
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            AuthError::MissingRefreshToken
                | AuthError::MissingRefreshParameters
                | AuthError::NotAuthenticated
                | AuthError::RefreshRejected { .. }
                | AuthError::TokenRefreshExhausted { .. }
        )
    }
}

/// Per-call mailbox API errors
#[derive(Error, Debug)]
pub enum ApiError {
    /// 401 from the mailbox API, handled upstream by refreshing the token
    #[error("Unauthorized: {body}")]
    Unauthorized { body: String },

    #[error("Mailbox API error: {status} {url} - {body}")]
    CallFailed {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// HTTP status of the failed call, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::CallFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Attachment sweep errors
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Failed to write attachment {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
