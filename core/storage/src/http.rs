//! Shared HTTP plumbing for the REST backends.

use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::time::Duration;

use imgbackup_common::{Error, Result};

use crate::provider::persist_stream;

const USER_AGENT: &str = concat!("imgbackup/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client used by one provider instance.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Send a request, mapping transport failures to `Error::Network`.
pub(crate) async fn send(request: RequestBuilder, what: &str) -> Result<Response> {
    request
        .send()
        .await
        .map_err(|e| Error::Network(format!("Failed to {}: {}", what, e)))
}

/// Map non-success status codes to errors, passing successful responses through.
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();

    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::NOT_FOUND {
        Err(Error::NotFound(format!("Resource not found: {}", response.url())))
    } else if status == StatusCode::UNAUTHORIZED {
        Err(Error::Authentication("Invalid or expired token".to_string()))
    } else if status == StatusCode::FORBIDDEN {
        Err(Error::PermissionDenied("Access denied".to_string()))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::Network(format!("API error: {} - {}", status, body)))
    }
}

/// Check the status and decode a JSON body.
pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T> {
    check_status(response)
        .await?
        .json()
        .await
        .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
}

/// Stream a response body into `destination` atomically.
pub(crate) async fn download_to(request: RequestBuilder, destination: &Path) -> Result<u64> {
    let response = check_status(send(request, "start download").await?).await?;
    let body = Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transfer(format!("Stream read error: {}", e)))),
    );
    persist_stream(destination, body).await
}
