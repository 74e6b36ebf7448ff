use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::config::Config;
use crate::error::ApiError;

/// Connect timeout for provider and mailbox connections (seconds)
const CONNECT_TIMEOUT: u64 = 30;

/// Build the shared HTTP client
pub fn build_client(config: &Config) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
        .timeout(Duration::from_secs(config.http_request_timeout))
        .build()
}

/// Bearer-authenticated handle on the mailbox REST API.
///
/// Performs exactly one HTTP call per operation. A 401 comes back as
/// `ApiError::Unauthorized` so the token manager can refresh; nothing is
/// retried here.
#[derive(Clone)]
pub struct GraphSession {
    client: Client,
    base_url: String,
    access_token: String,
}

impl std::fmt::Debug for GraphSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSession")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GraphSession {
    pub fn new(client: Client, base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Absolute URL for an API path; absolute inputs (nextLink) pass through
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let request = self.client.get(self.url(path)).query(query);
        let response = self.execute(request).await?;
        decode_json(response).await
    }

    /// GET a collection and follow `@odata.nextLink` until exhausted
    pub async fn get_collection(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();
        let mut page = self.get_json(path, query).await?;

        loop {
            if let Some(Value::Array(values)) = page.get_mut("value").map(Value::take) {
                items.extend(values);
            }

            let Some(next) = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                break;
            };

            tracing::debug!(url = %next, "Following nextLink");
            page = self.get_json(&next, &[]).await?;
        }

        Ok(items)
    }

    pub async fn get_bytes(&self, path: &str) -> Result<Bytes, ApiError> {
        let request = self.client.get(self.url(path));
        let response = self.execute(request).await?;
        Ok(response.bytes().await?)
    }

    pub async fn patch_json(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let request = self.client.patch(self.url(path)).json(body);
        let response = self.execute(request).await?;
        decode_json(response).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let request = self.client.post(self.url(path)).json(body);
        let response = self.execute(request).await?;
        decode_json(response).await
    }

    /// POST without a request body (action endpoints such as `send`)
    pub async fn post_empty(&self, path: &str) -> Result<Value, ApiError> {
        let request = self
            .client
            .post(self.url(path))
            .header(reqwest::header::CONTENT_LENGTH, 0);
        let response = self.execute(request).await?;
        decode_json(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(path));
        self.execute(request).await?;
        Ok(())
    }

    /// Send with the bearer token and map the status
    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let request = request.bearer_auth(&self.access_token).build()?;
        let method = request.method().clone();
        let url = request.url().to_string();

        tracing::debug!(method = %method, url = %url, "Sending mailbox request");

        let response = self.client.execute(request).await.map_err(|e| {
            tracing::error!(method = %method, url = %url, error = %e, "Mailbox request error");
            ApiError::Transport(e)
        })?;

        let status = response.status();
        if is_success(status) {
            tracing::debug!(status = status.as_u16(), "Mailbox request successful");
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(method = %method, url = %url, "Mailbox API answered 401");
            return Err(ApiError::Unauthorized { body });
        }

        tracing::error!(
            status = status.as_u16(),
            method = %method,
            url = %url,
            response_body = %body,
            "Mailbox request failed"
        );
        Err(ApiError::CallFailed {
            status: status.as_u16(),
            url,
            body,
        })
    }
}

fn is_success(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 201 | 202 | 204)
}

/// JSON body, or `Value::Null` when the response has none
async fn decode_json(response: Response) -> Result<Value, ApiError> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}
