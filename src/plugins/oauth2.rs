use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::http::{split_header, HttpClient, HttpResponse};
use crate::log::LogBook;
use crate::plugin::{Listener, ListenerResult, ListenerTarget};
use crate::types::ListenerInstanceId;

/// Seconds shaved off the reported token lifetime.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Identity provider calls do not use the listener timeout.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// When a token reported to live `expires_in` seconds stops being reused.
/// Lifetimes past the representable range are capped instead of overflowing.
fn token_expiry(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    let lifetime = expires_in.saturating_sub(EXPIRY_SKEW_SECS);
    if lifetime <= 0 {
        return now;
    }
    ChronoDuration::try_seconds(lifetime)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Client-credentials configuration carried in the listener type options.
///
/// ```json
/// {
///   "identityProviderUrl": "https://auth.example.com/token",
///   "clientId": "client_id",
///   "clientSecret": "client_secret",
///   "scope": "api.read api.write"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OAuth2Options {
    pub identity_provider_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

impl OAuth2Options {
    fn form_body(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", &self.client_secret)
            .append_pair("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Delivers with a bearer token obtained through the OAuth2
/// client-credentials grant.
///
/// The token is cached per plugin instance. A 401 from the target drops the
/// cache, fetches one fresh token and retries the call once.
pub struct OAuth2Listener {
    target: ListenerTarget,
    http: Arc<dyn HttpClient>,
    token: Mutex<Option<CachedToken>>,
}

impl OAuth2Listener {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            target: ListenerTarget::default(),
            http,
            token: Mutex::new(None),
        }
    }

    async fn bearer_token(&self, options: &OAuth2Options, logs: &mut LogBook) -> Option<String> {
        {
            let guard = self.token.lock().await;
            if let Some(cached) = guard.as_ref() {
                if !cached.value.is_empty() && Utc::now() < cached.expires_at {
                    logs.debug("Using cached bearer token");
                    return Some(cached.value.clone());
                }
            }
        }

        logs.info(format!(
            "Requesting bearer token from {}",
            options.identity_provider_url
        ));

        let headers = vec!["Content-Type: application/x-www-form-urlencoded".to_string()];
        let response = self
            .http
            .post(
                &options.identity_provider_url,
                &headers,
                &options.form_body(),
                TOKEN_REQUEST_TIMEOUT,
            )
            .await;

        let response = match response {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                logs.error(
                    format!("Failed to obtain token: {}", response.status),
                    response.body,
                );
                return None;
            }
            Err(err) => {
                logs.error(format!("Failed to obtain token: {}", err), format!("{:?}", err));
                return None;
            }
        };

        let parsed: TokenResponse = match serde_json::from_str(&response.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                logs.error("Failed to parse token response", err.to_string());
                return None;
            }
        };

        let expires_at = token_expiry(Utc::now(), parsed.expires_in);
        *self.token.lock().await = Some(CachedToken {
            value: parsed.access_token.clone(),
            expires_at,
        });
        logs.info("Bearer token obtained successfully");

        Some(parsed.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn call(&self, token: &str, event_data: &str) -> Result<HttpResponse, TransportError> {
        let mut headers: Vec<String> = self
            .target
            .headers
            .iter()
            .filter(|h| {
                split_header(h)
                    .map(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        headers.push(format!("Authorization: Bearer {}", token));

        self.http
            .post(&self.target.url, &headers, event_data, self.target.timeout())
            .await
    }
}

#[async_trait]
impl Listener for OAuth2Listener {
    fn configure(&mut self, target: ListenerTarget) {
        self.target = target;
    }

    fn target(&self) -> &ListenerTarget {
        &self.target
    }

    async fn execute(
        &self,
        listener_instance_id: ListenerInstanceId,
        event_data: &str,
        type_options: &str,
    ) -> ListenerResult {
        let mut logs = LogBook::new("listenerInstance.Id", listener_instance_id);

        let options: OAuth2Options = match serde_json::from_str(type_options) {
            Ok(options) => options,
            Err(err) => {
                logs.error("Failed to parse authentication configuration", err.to_string());
                return ListenerResult::failure(
                    "Failed to parse authentication configuration",
                    logs.into_entries(),
                );
            }
        };

        if options.identity_provider_url.trim().is_empty() {
            logs.error("TypeOptions is missing or invalid", "identityProviderUrl is empty");
            return ListenerResult::failure("TypeOptions is missing or invalid", logs.into_entries());
        }

        let Some(token) = self.bearer_token(&options, &mut logs).await else {
            return ListenerResult::failure("Failed to obtain bearer token", logs.into_entries());
        };

        let first = match self.call(&token, event_data).await {
            Ok(response) => response,
            Err(err) => {
                let message = format!("Exception during execution: {}", err);
                logs.error(message.clone(), format!("{:?}", err));
                return ListenerResult::failure(message, logs.into_entries());
            }
        };

        if first.is_success() {
            let message = format!("HTTP call succeeded with status code {}", first.status);
            logs.info(message.clone());
            return ListenerResult::success(message, logs.into_entries());
        }

        if first.status != 401 {
            let message = format!("HTTP call failed with status code {}", first.status);
            logs.error(message.clone(), first.body);
            return ListenerResult::failure(message, logs.into_entries());
        }

        logs.warn("Received 401, attempting token refresh");
        self.invalidate_token().await;

        let Some(token) = self.bearer_token(&options, &mut logs).await else {
            return ListenerResult::failure(
                "Failed to obtain bearer token after 401",
                logs.into_entries(),
            );
        };

        match self.call(&token, event_data).await {
            Ok(retry) if retry.is_success() => {
                let message = format!("HTTP call succeeded after token refresh: {}", retry.status);
                logs.info(message.clone());
                ListenerResult::success(message, logs.into_entries())
            }
            Ok(retry) => {
                let message = format!("HTTP call failed after token refresh: {}", retry.status);
                logs.error(message.clone(), retry.body);
                ListenerResult::failure(message, logs.into_entries())
            }
            Err(err) => {
                let message = format!("Exception during execution: {}", err);
                logs.error(message.clone(), format!("{:?}", err));
                ListenerResult::failure(message, logs.into_entries())
            }
        }
    }
}
