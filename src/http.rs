use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Response returned by an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,

    /// Response headers in `Name: value` form.
    pub headers: Vec<String>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound transport used by listener plugins.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST `body` to `url`.
    ///
    /// `headers` are `Name: value` strings. Any response, including
    /// non-2xx, is `Ok`; `Err` means no response was received.
    async fn post(
        &self,
        url: &str,
        headers: &[String],
        body: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// Split a `Name: value` header. Returns `None` for malformed entries.
pub fn split_header(header: &str) -> Option<(&str, &str)> {
    let (name, value) = header.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// Copy `headers`, adding `content-type: application/json` when no content
/// type is present.
pub fn with_default_content_type(headers: &[String]) -> Vec<String> {
    let mut out: Vec<String> = headers
        .iter()
        .filter(|h| !h.trim().is_empty())
        .cloned()
        .collect();
    let has_content_type = out.iter().any(|h| {
        split_header(h)
            .map(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .unwrap_or(false)
    });
    if !has_content_type {
        out.push("content-type: application/json".to_string());
    }
    out
}

/// `reqwest`-backed transport.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post(
        &self,
        url: &str,
        headers: &[String],
        body: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self
            .client
            .post(url)
            .body(body.to_string())
            .timeout(timeout);

        for header in with_default_content_type(headers) {
            match split_header(&header) {
                Some((name, value)) => request = request.header(name, value),
                None => {
                    return Err(TransportError::InvalidRequest(format!(
                        "malformed header: {}",
                        header
                    )))
                }
            }
        }

        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                format!("{}: {}", name.as_str(), value.to_str().unwrap_or_default())
            })
            .collect();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse { status, body, headers })
    }
}

#[cfg(feature = "http")]
fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}
