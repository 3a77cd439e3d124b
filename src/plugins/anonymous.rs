use std::sync::Arc;

use async_trait::async_trait;

use crate::http::HttpClient;
use crate::log::LogBook;
use crate::plugin::{Listener, ListenerResult, ListenerTarget};
use crate::types::ListenerInstanceId;

/// Pass-through delivery: one POST with the configured headers, 2xx is
/// success.
pub struct AnonymousListener {
    target: ListenerTarget,
    http: Arc<dyn HttpClient>,
}

impl AnonymousListener {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            target: ListenerTarget::default(),
            http,
        }
    }
}

#[async_trait]
impl Listener for AnonymousListener {
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
        _type_options: &str,
    ) -> ListenerResult {
        let mut logs = LogBook::new("listenerInstance.Id", listener_instance_id);
        logs.debug(format!("posting to {}", self.target.url));

        let result = self
            .http
            .post(&self.target.url, &self.target.headers, event_data, self.target.timeout())
            .await;

        let (succeeded, message) = match result {
            Ok(response) if response.is_success() => {
                let message = format!("HTTP call succeeded with status code {}", response.status);
                logs.info(message.clone());
                (true, message)
            }
            Ok(response) => {
                let message = format!("HTTP call failed with status code {}", response.status);
                logs.error(message.clone(), response.body);
                (false, message)
            }
            Err(err) => {
                let message = format!("Exception during execution: {}", err);
                logs.error(message.clone(), format!("{:?}", err));
                (false, message)
            }
        };

        ListenerResult {
            succeeded,
            message,
            logs: logs.into_entries(),
        }
    }
}
