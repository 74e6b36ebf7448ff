// Authentication module
// Authorization-code acquisition, token persistence and the token lifecycle

mod types;
mod authorize;
mod callback;
mod credentials;
mod manager;
mod token_endpoint;

pub use authorize::{run_flow, start_flow, AuthorizationRequest};
pub use callback::{AcquiredToken, CallbackContext, CallbackListener, CallbackServer, MAX_EXCHANGE_ATTEMPTS};
pub use credentials::{load_token_file, rewrite_env_file, timestamp, CredentialStore};
pub use manager::{TokenManager, MAX_REFRESH_ATTEMPTS};
pub use token_endpoint::{token_prefix, GrantFailure, TokenEndpoint};
pub use types::{OAuthCredentials, PersistedToken, TokenArchiveEntry, TokenPair, TokenResponse};
