// One-shot local listener for the authorization redirect

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tower_http::trace::TraceLayer;

use super::token_endpoint::{token_prefix, GrantFailure, TokenEndpoint};
use super::types::{OAuthCredentials, TokenResponse};
use crate::error::AuthError;

/// Initial exchange plus three retries
pub const MAX_EXCHANGE_ATTEMPTS: u32 = 4;

/// Token pair obtained from a completed redirect
#[derive(Debug, Clone)]
pub struct AcquiredToken {
    pub credentials: OAuthCredentials,
    pub response: TokenResponse,
}

/// What the listener needs to redeem the code it receives
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub endpoint: TokenEndpoint,
    /// Client identity the token pair is issued to
    pub credentials: OAuthCredentials,
    pub redirect_uri: String,
    /// `state` sent with the authorization request
    pub expected_state: String,
}

type ResultSender = oneshot::Sender<Result<AcquiredToken, AuthError>>;

#[derive(Clone)]
struct CallbackState {
    context: Arc<CallbackContext>,
    result_tx: Arc<Mutex<Option<ResultSender>>>,
}

/// Bound but not yet serving listener
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    pub async fn bind(addr: &str) -> Result<Self, AuthError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Callback listener bound to {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AuthError> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting the redirect
    pub fn serve(self, context: CallbackContext) -> CallbackServer {
        let path = redirect_path(&context.redirect_uri);
        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = CallbackState {
            context: Arc::new(context),
            result_tx: Arc::new(Mutex::new(Some(result_tx))),
        };
        let app = router(&path, state);

        let handle = tokio::spawn(async move {
            let served = axum::serve(self.listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!("Callback listener failed: {}", e);
            }
        });

        CallbackServer {
            result_rx,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }
}

/// Running listener; yields exactly one result
pub struct CallbackServer {
    result_rx: oneshot::Receiver<Result<AcquiredToken, AuthError>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    /// Wait for the redirect to be handled, then shut the listener down
    pub async fn wait(mut self) -> Result<AcquiredToken, AuthError> {
        let result = (&mut self.result_rx).await;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Lets the in-flight callback page finish writing
        if tokio::time::timeout(Duration::from_secs(5), &mut self.handle)
            .await
            .is_err()
        {
            tracing::warn!("Callback listener did not stop in time, aborting it");
            self.handle.abort();
        }

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(AuthError::Io(std::io::Error::other(
                "callback listener stopped before a redirect arrived",
            ))),
        }
    }
}

/// Path component of the redirect URI, `/` when it cannot be parsed
fn redirect_path(redirect_uri: &str) -> String {
    reqwest::Url::parse(redirect_uri)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| "/".to_string())
}

fn router(path: &str, state: CallbackState) -> Router {
    Router::new()
        .route(path, get(handle_callback))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(result_tx) = state.result_tx.lock().await.take() else {
        tracing::warn!("Redirect received after the flow already completed");
        return (
            StatusCode::CONFLICT,
            Html(render_page(&CallbackPage {
                heading: "Authorization already handled",
                code: params.get("code").map(String::as_str),
                state: params.get("state").map(String::as_str),
                attempts: &[],
                status: StatusCode::CONFLICT,
                text: "This listener accepts a single redirect. Close this window.",
            })),
        )
            .into_response();
    };

    let code = params.get("code").map(String::as_str).filter(|s| !s.is_empty());
    let received_state = params.get("state").map(String::as_str).filter(|s| !s.is_empty());

    let (outcome, attempts) = match (code, received_state) {
        (Some(code), Some(received_state)) => {
            tracing::info!(
                "Redirect received: code={}..., state={}",
                token_prefix(code),
                received_state
            );
            if received_state != state.context.expected_state {
                (
                    Err(AuthError::StateMismatch {
                        expected: state.context.expected_state.clone(),
                        received: received_state.to_string(),
                    }),
                    Vec::new(),
                )
            } else {
                exchange_with_retries(&state.context, code).await
            }
        }
        _ => (Err(AuthError::MissingCallbackParameters), Vec::new()),
    };

    let (status, heading, text) = match &outcome {
        Ok(_) => (
            StatusCode::OK,
            "Authorization complete",
            "Tokens received. You can close this window.".to_string(),
        ),
        Err(e) => {
            tracing::error!("Authorization flow failed: {}", e);
            (e.http_status(), "Authorization failed", e.to_string())
        }
    };

    let page = render_page(&CallbackPage {
        heading,
        code,
        state: received_state,
        attempts: &attempts,
        status,
        text: &text,
    });

    let _ = result_tx.send(outcome);
    (status, Html(page)).into_response()
}

/// Redeem the code, retrying rejected exchanges up to the attempt bound
async fn exchange_with_retries(
    context: &CallbackContext,
    code: &str,
) -> (Result<AcquiredToken, AuthError>, Vec<GrantFailure>) {
    let mut failures = Vec::new();

    for attempt in 1..=MAX_EXCHANGE_ATTEMPTS {
        let outcome = context
            .endpoint
            .exchange_code(&context.credentials, &context.redirect_uri, code)
            .await;

        match outcome {
            Ok(Ok(response)) => {
                let result = context
                    .credentials
                    .with_token_response(&response, None)
                    .map(|credentials| AcquiredToken {
                        credentials,
                        response,
                    });
                return (result, failures);
            }
            Ok(Err(failure)) => {
                tracing::warn!(
                    attempt,
                    status = failure.status,
                    "Token exchange attempt {}/{} rejected",
                    attempt,
                    MAX_EXCHANGE_ATTEMPTS
                );
                failures.push(failure);
            }
            Err(e) => return (Err(e), failures),
        }
    }

    let last = failures
        .last()
        .cloned()
        .unwrap_or(GrantFailure {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            body: String::new(),
        });
    (
        Err(AuthError::ExchangeRejected {
            status: last.status,
            body: last.body,
        }),
        failures,
    )
}

struct CallbackPage<'a> {
    heading: &'a str,
    code: Option<&'a str>,
    state: Option<&'a str>,
    attempts: &'a [GrantFailure],
    status: StatusCode,
    text: &'a str,
}

fn render_page(page: &CallbackPage<'_>) -> String {
    let mut attempts = String::new();
    for (i, failure) in page.attempts.iter().enumerate() {
        attempts.push_str(&format!(
            "<li>Attempt {}: status {} - {}</li>\n",
            i + 1,
            failure.status,
            escape_html(&failure.body)
        ));
    }
    if !attempts.is_empty() {
        attempts = format!("<h2>Rejected token exchanges</h2>\n<ul>\n{}</ul>\n", attempts);
    }

    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{heading}</title></head>\n<body>\n\
         <h1>{heading}</h1>\n\
         <p>Code: {code}</p>\n\
         <p>State: {state}</p>\n\
         {attempts}\
         <p>Status: {status}</p>\n\
         <p>Text: {text}</p>\n\
         </body>\n</html>\n",
        heading = escape_html(page.heading),
        code = escape_html(page.code.unwrap_or("-")),
        state = escape_html(page.state.unwrap_or("-")),
        attempts = attempts,
        status = page.status.as_u16(),
        text = escape_html(page.text),
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use reqwest::Client;
    use tower::ServiceExt;

    fn context(token_url: &str) -> CallbackContext {
        CallbackContext {
            endpoint: TokenEndpoint::new(Client::new(), token_url),
            credentials: OAuthCredentials {
                client_id: "client-123".to_string(),
                client_secret: "secret-456".to_string(),
                tenant_id: "consumers".to_string(),
                scope: "offline_access Mail.ReadWrite".to_string(),
                tokens: None,
                token_type: None,
                expires_in: None,
                issued_at: None,
            },
            redirect_uri: "http://localhost:8000/".to_string(),
            expected_state: "expected-state".to_string(),
        }
    }

    fn create_test_app(
        token_url: &str,
    ) -> (Router, oneshot::Receiver<Result<AcquiredToken, AuthError>>) {
        let (tx, rx) = oneshot::channel();
        let state = CallbackState {
            context: Arc::new(context(token_url)),
            result_tx: Arc::new(Mutex::new(Some(tx))),
        };
        (router("/", state), rx)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_parameters_is_400() {
        let (app, rx) = create_test_app("http://127.0.0.1:1/token");

        let response = app.clone().oneshot(get("/?code=abc")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_text(response).await;
        assert!(body.contains("Missing &#39;code&#39; or &#39;state&#39;"));

        assert!(matches!(
            rx.await.unwrap(),
            Err(AuthError::MissingCallbackParameters)
        ));
    }

    #[tokio::test]
    async fn test_state_mismatch_is_400() {
        let (app, rx) = create_test_app("http://127.0.0.1:1/token");

        let response = app
            .clone()
            .oneshot(get("/?code=abc&state=forged"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        match rx.await.unwrap() {
            Err(AuthError::StateMismatch { expected, received }) => {
                assert_eq!(expected, "expected-state");
                assert_eq!(received, "forged");
            }
            other => panic!("expected StateMismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_redirect_is_conflict() {
        let (app, _rx) = create_test_app("http://127.0.0.1:1/token");

        let first = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(first.status(), StatusCode::BAD_REQUEST);

        let second = app
            .clone()
            .oneshot(get("/?code=abc&state=expected-state"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_successful_exchange_page() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at-1","refresh_token":"rt-1","token_type":"Bearer"}"#)
            .create_async()
            .await;

        let (app, rx) = create_test_app(&format!("{}/token", server.url()));
        let response = app
            .clone()
            .oneshot(get("/?code=the-code&state=expected-state"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        assert!(body.contains("Code: the-code"));
        assert!(body.contains("State: expected-state"));
        assert!(body.contains("Status: 200"));

        let acquired = rx.await.unwrap().unwrap();
        assert_eq!(acquired.credentials.access_token(), Some("at-1"));
        assert_eq!(acquired.credentials.refresh_token(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_rejected_exchange_is_retried_then_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(MAX_EXCHANGE_ATTEMPTS as usize)
            .create_async()
            .await;

        let (app, rx) = create_test_app(&format!("{}/token", server.url()));
        let response = app
            .clone()
            .oneshot(get("/?code=the-code&state=expected-state"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_text(response).await;
        for attempt in 1..=MAX_EXCHANGE_ATTEMPTS {
            assert!(body.contains(&format!("Attempt {}: status 400", attempt)));
        }
        assert!(!body.contains("Attempt 5"));

        assert!(matches!(
            rx.await.unwrap(),
            Err(AuthError::ExchangeRejected { status: 400, .. })
        ));
        mock.assert_async().await;
    }

    #[test]
    fn test_redirect_path() {
        assert_eq!(redirect_path("http://localhost:8000/"), "/");
        assert_eq!(redirect_path("http://localhost:8000/callback"), "/callback");
        assert_eq!(redirect_path("not a url"), "/");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>"x" & 'y'</script>"#),
            "&lt;script&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/script&gt;"
        );
    }
}
