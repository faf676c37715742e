//! Automation webhook client.
//!
//! Connection management and outbound messaging are delegated to external
//! automation endpoints registered by name in the `webhooks` table. Each call
//! is a POST of a flat JSON body; only a 2xx status counts as accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::models::WebhookEndpoint;
use crate::errors::{DashboardError, DashboardResult};

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    CreateInstance,
    DeleteInstance,
    GenerateQr,
    SendMessage,
}

impl WebhookAction {
    /// Registry name the endpoint is stored under.
    pub fn registry_name(&self) -> &'static str {
        match self {
            Self::CreateInstance => "create_instance",
            Self::DeleteInstance => "delete_instance",
            Self::GenerateQr => "generate_qr",
            Self::SendMessage => "send_message",
        }
    }

    pub fn all() -> [WebhookAction; 4] {
        [
            Self::CreateInstance,
            Self::DeleteInstance,
            Self::GenerateQr,
            Self::SendMessage,
        ]
    }
}

impl std::str::FromStr for WebhookAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|a| a.registry_name() == s)
            .ok_or_else(|| format!("Invalid webhook name: {}", s))
    }
}

impl std::fmt::Display for WebhookAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.registry_name())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub instance_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl WebhookPayload {
    pub fn for_instance(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> DashboardResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DashboardError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// POST `payload` to `endpoint`. The response body is returned as JSON
    /// when it parses, as a JSON string otherwise, and `null` when empty.
    pub async fn post(
        &self,
        endpoint: &WebhookEndpoint,
        payload: &WebhookPayload,
    ) -> DashboardResult<serde_json::Value> {
        tracing::info!(
            webhook = %endpoint.name,
            instance = %payload.instance_name,
            "calling automation webhook"
        );
        let resp = self.http.post(&endpoint.url).json(payload).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            tracing::warn!(webhook = %endpoint.name, status = status.as_u16(), "webhook rejected request");
            let message = if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request rejected")
                    .to_string()
            } else {
                text
            };
            return Err(DashboardError::WriteRejected {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}

/// Resolve a registry lookup, turning a missing entry into a validation
/// error so no request is attempted.
pub fn require_endpoint(
    action: WebhookAction,
    found: Option<WebhookEndpoint>,
) -> DashboardResult<WebhookEndpoint> {
    found.ok_or_else(|| {
        DashboardError::Validation(format!(
            "No webhook registered for '{}'",
            action.registry_name()
        ))
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};

    /// A local HTTP endpoint that records JSON bodies and answers with a
    /// fixed status.
    pub struct RecordingEndpoint {
        pub url: String,
        pub received: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    pub async fn spawn_endpoint(status: StatusCode, reply: serde_json::Value) -> RecordingEndpoint {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(log): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                          Json(body): Json<serde_json::Value>| {
                        let reply = reply.clone();
                        async move {
                            log.lock().unwrap().push(body);
                            (status, Json(reply))
                        }
                    },
                ),
            )
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        RecordingEndpoint {
            url: format!("http://{}/hook", addr),
            received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::spawn_endpoint;
    use super::*;
    use axum::http::StatusCode;

    fn endpoint(url: &str) -> WebhookEndpoint {
        WebhookEndpoint {
            name: "send_message".into(),
            url: url.into(),
        }
    }

    #[test]
    fn test_payload_omits_absent_fields() {
        let payload = WebhookPayload {
            phone_number: Some("+5511".into()),
            ..WebhookPayload::for_instance("shop")
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"instance_name": "shop", "phone_number": "+5511"})
        );
    }

    #[test]
    fn test_action_registry_names_round_trip() {
        for action in WebhookAction::all() {
            assert_eq!(action.registry_name().parse::<WebhookAction>().unwrap(), action);
        }
        assert!("nope".parse::<WebhookAction>().is_err());
    }

    #[test]
    fn test_missing_registry_entry_is_validation_error() {
        let err = require_endpoint(WebhookAction::GenerateQr, None).unwrap_err();
        assert!(matches!(err, DashboardError::Validation(ref m) if m.contains("generate_qr")));
    }

    #[tokio::test]
    async fn test_success_returns_json_body() {
        let server = spawn_endpoint(StatusCode::OK, serde_json::json!({"qrcode": "abc"})).await;
        let client = WebhookClient::new(DEFAULT_WEBHOOK_TIMEOUT).unwrap();
        let reply = client
            .post(&endpoint(&server.url), &WebhookPayload::for_instance("shop"))
            .await
            .unwrap();
        assert_eq!(reply["qrcode"], "abc");
        let received = server.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["instance_name"], "shop");
    }

    #[tokio::test]
    async fn test_non_2xx_is_write_rejection() {
        let server =
            spawn_endpoint(StatusCode::BAD_GATEWAY, serde_json::json!({"error": "down"})).await;
        let client = WebhookClient::new(DEFAULT_WEBHOOK_TIMEOUT).unwrap();
        let err = client
            .post(&endpoint(&server.url), &WebhookPayload::for_instance("shop"))
            .await
            .unwrap_err();
        match err {
            DashboardError::WriteRejected { status, message } => {
                assert_eq!(status, 502);
                assert!(message.contains("down"));
            }
            other => panic!("Expected WriteRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = WebhookClient::new(Duration::from_secs(2)).unwrap();
        let err = client
            .post(
                &endpoint(&format!("http://{}/hook", addr)),
                &WebhookPayload::for_instance("shop"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Transport(_)));
    }
}
