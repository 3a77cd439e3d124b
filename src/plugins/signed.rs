use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::http::HttpClient;
use crate::log::LogBook;
use crate::plugin::{Listener, ListenerResult, ListenerTarget};
use crate::signing::{compute_signature, DEFAULT_SIGNATURE_HEADER, DEFAULT_TIMESTAMP_HEADER};
use crate::types::ListenerInstanceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignedOptions {
    pub secret: String,
    pub signature_header: String,
    pub timestamp_header: String,
    pub include_timestamp: bool,
}

impl Default for SignedOptions {
    fn default() -> Self {
        Self {
            secret: String::new(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            timestamp_header: DEFAULT_TIMESTAMP_HEADER.to_string(),
            include_timestamp: true,
        }
    }
}

/// Posts the payload once with an HMAC-SHA256 signature header.
pub struct SignedListener {
    target: ListenerTarget,
    http: Arc<dyn HttpClient>,
}

impl SignedListener {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            target: ListenerTarget::default(),
            http,
        }
    }
}

#[async_trait]
impl Listener for SignedListener {
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

        let options = match serde_json::from_str::<SignedOptions>(type_options) {
            Ok(options) if !options.secret.is_empty() => options,
            Ok(_) => {
                logs.error("TypeOptions is missing or invalid", "secret is empty");
                return ListenerResult::failure("TypeOptions is missing or invalid", logs.into_entries());
            }
            Err(err) => {
                logs.error("Failed to parse signing configuration", err.to_string());
                return ListenerResult::failure(
                    "Failed to parse signing configuration",
                    logs.into_entries(),
                );
            }
        };

        let timestamp = options
            .include_timestamp
            .then(|| Utc::now().timestamp().to_string());

        let signature = match compute_signature(
            options.secret.as_bytes(),
            event_data.as_bytes(),
            timestamp.as_deref(),
        ) {
            Ok(signature) => signature,
            Err(err) => {
                logs.error("Failed to sign payload", err.to_string());
                return ListenerResult::failure("Failed to sign payload", logs.into_entries());
            }
        };

        let mut headers = self.target.headers.clone();
        headers.push(format!("{}: {}", options.signature_header, signature));
        if let Some(ts) = &timestamp {
            headers.push(format!("{}: {}", options.timestamp_header, ts));
        }
        logs.debug(format!("posting signed payload to {}", self.target.url));

        match self
            .http
            .post(&self.target.url, &headers, event_data, self.target.timeout())
            .await
        {
            Ok(response) if response.is_success() => {
                let message = format!("HTTP call succeeded with status code {}", response.status);
                logs.info(message.clone());
                ListenerResult::success(message, logs.into_entries())
            }
            Ok(response) => {
                let message = format!("HTTP call failed with status code {}", response.status);
                logs.error(message.clone(), response.body);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::plugins::testing::ScriptedHttp;
    use crate::signing::verify_delivery;

    fn listener(http: Arc<ScriptedHttp>) -> SignedListener {
        let mut listener = SignedListener::new(http);
        listener.configure(ListenerTarget::new("https://hooks.example.com/signed", 1, vec![]));
        listener
    }

    #[tokio::test]
    async fn receiver_can_verify_delivered_signature() {
        let http = Arc::new(ScriptedHttp::new(vec![Ok(HttpResponse::new(200, ""))]));
        let result = listener(http.clone())
            .execute(ListenerInstanceId(5), r#"{"order":1}"#, r#"{"secret":"shh"}"#)
            .await;
        assert!(result.succeeded, "{}", result.message);

        let call = &http.calls()[0];
        let verified = verify_delivery(
            &call.headers,
            call.body.as_bytes(),
            b"shh",
            DEFAULT_SIGNATURE_HEADER,
            DEFAULT_TIMESTAMP_HEADER,
            Some(300),
            Utc::now().timestamp(),
        );
        assert!(verified.is_ok(), "{:?}", verified);
    }

    #[tokio::test]
    async fn custom_header_without_timestamp() {
        let http = Arc::new(ScriptedHttp::new(vec![Ok(HttpResponse::new(200, ""))]));
        let options = r#"{"secret":"shh","signatureHeader":"X-Sig","includeTimestamp":false}"#;
        listener(http.clone())
            .execute(ListenerInstanceId(1), "{}", options)
            .await;

        let headers = &http.calls()[0].headers;
        assert_eq!(headers.len(), 1);
        assert!(headers[0].starts_with("X-Sig: sha256="));
    }

    #[tokio::test]
    async fn empty_secret_is_rejected_before_posting() {
        let http = Arc::new(ScriptedHttp::new(vec![]));
        let result = listener(http.clone())
            .execute(ListenerInstanceId(1), "{}", "{}")
            .await;

        assert!(!result.succeeded);
        assert!(http.calls().is_empty());
    }
}
