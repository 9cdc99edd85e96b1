//! HTTP implementation of [`PanelClient`].
//!
//! Speaks the panel's fixed protocol: form-encoded POSTs carrying `key` and
//! `action`, JSON responses. Reuses a single `reqwest::Client` for
//! connection pooling.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{PanelClient, PanelOrderStatus, RawStatusResponse, RawSubmitResponse};
use crate::error::WorkerError;

/// Markers some panels put in a 200 body instead of returning HTTP 429.
const RATE_LIMIT_MARKERS: [&str; 2] = ["rate limit", "too many requests"];

/// Panel API client over HTTP.
pub struct HttpPanelClient {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPanelClient {
    /// Build a client for the given panel endpoint.
    ///
    /// `timeout` bounds each individual attempt; retries are the caller's
    /// concern.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            client,
            timeout,
        })
    }

    /// POST a form to the panel and return the response body on HTTP success.
    async fn post_form(&self, fields: &[(&str, &str)]) -> Result<String, WorkerError> {
        let response = self
            .client
            .post(&self.api_url)
            .timeout(self.timeout)
            .form(fields)
            .send()
            .await
            .map_err(|e| WorkerError::transport(format!("panel request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| WorkerError::transport(format!("failed to read panel response: {e}")))?;

        if status.as_u16() == 429 {
            return Err(WorkerError::Transport {
                message: "panel rate limit (HTTP 429)".to_string(),
                rate_limited: true,
            });
        }
        if !status.is_success() {
            return Err(WorkerError::transport(format!(
                "panel returned HTTP {status}"
            )));
        }
        if is_rate_limit_body(&body) {
            return Err(WorkerError::Transport {
                message: "panel rate limit (body marker)".to_string(),
                rate_limited: true,
            });
        }

        Ok(body)
    }
}

/// Whether a 200 body is actually a rate-limit refusal in disguise.
fn is_rate_limit_body(body: &str) -> bool {
    let lowered = body.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Extract the external order id from the panel's loosely typed `order` field.
///
/// The protocol documents an integer, but ids are opaque to us; accept a
/// string as well and carry it verbatim.
fn order_id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl PanelClient for HttpPanelClient {
    async fn submit(
        &self,
        service_id: &str,
        link: &str,
        quantity: u32,
    ) -> Result<String, WorkerError> {
        let quantity = quantity.to_string();
        let fields = [
            ("key", self.api_key.as_str()),
            ("action", "add"),
            ("service", service_id),
            ("link", link),
            ("quantity", quantity.as_str()),
        ];

        let body = self.post_form(&fields).await?;
        let parsed: RawSubmitResponse = serde_json::from_str(&body).map_err(|e| {
            WorkerError::ProtocolViolation(format!("unparseable submit response: {e}"))
        })?;

        if !parsed.success {
            return Err(WorkerError::ProviderRejected(
                "panel returned success=false".to_string(),
            ));
        }

        let external_id = parsed
            .order
            .as_ref()
            .and_then(order_id_from_value)
            .ok_or_else(|| {
                WorkerError::ProviderRejected("panel omitted the order id".to_string())
            })?;

        debug!(service_id, external_id = %external_id, "panel accepted order");
        Ok(external_id)
    }

    async fn status(&self, external_order_id: &str) -> Result<PanelOrderStatus, WorkerError> {
        let fields = [
            ("key", self.api_key.as_str()),
            ("action", "status"),
            ("order", external_order_id),
        ];

        let body = self.post_form(&fields).await?;
        let parsed: RawStatusResponse = serde_json::from_str(&body).map_err(|e| {
            WorkerError::ProtocolViolation(format!("unparseable status response: {e}"))
        })?;

        Ok(parsed.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_body_detection() {
        assert!(is_rate_limit_body("Rate Limit exceeded, slow down"));
        assert!(is_rate_limit_body("{\"error\":\"Too Many Requests\"}"));
        assert!(!is_rate_limit_body("{\"order\":9001,\"success\":true}"));
    }

    #[test]
    fn test_order_id_from_value() {
        assert_eq!(
            order_id_from_value(&serde_json::json!(9001)),
            Some("9001".to_string())
        );
        assert_eq!(
            order_id_from_value(&serde_json::json!("9001")),
            Some("9001".to_string())
        );
        assert_eq!(order_id_from_value(&serde_json::json!("")), None);
        assert_eq!(order_id_from_value(&serde_json::Value::Null), None);
    }

    #[test]
    fn test_submit_response_shapes() {
        let ok: RawSubmitResponse =
            serde_json::from_str(r#"{"order":9001,"success":true}"#).unwrap();
        assert!(ok.success);
        assert_eq!(order_id_from_value(ok.order.as_ref().unwrap()).unwrap(), "9001");

        let rejected: RawSubmitResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(!rejected.success);
        assert!(rejected.order.is_none());
    }
}
