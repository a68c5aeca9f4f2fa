//! Web hook delivery

use crate::error::{ClientError, Result};
use crate::USER_AGENT;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Successful delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResponse {
    pub status: u16,
    /// e.g. "200 OK"
    pub reason: String,
}

/// HTTP client used to POST notifications to hook addresses
///
/// Holds two connection pools: one that verifies certificates and one for
/// hooks registered with `insecure_ssl`.
#[derive(Debug, Clone)]
pub struct HookClient {
    client: Client,
    insecure_client: Client,
}

impl HookClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let insecure_client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            insecure_client,
        })
    }

    /// POST `body` as JSON to `address`
    ///
    /// Non-2xx responses are returned as [`ClientError::ApiError`].
    #[instrument(skip(self, body), fields(address = %address))]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        address: &str,
        body: &T,
        insecure_ssl: bool,
    ) -> Result<HookResponse> {
        let client = if insecure_ssl {
            &self.insecure_client
        } else {
            &self.client
        };
        let payload = serde_json::to_vec(body)?;

        let response = client
            .post(address)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let reason = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .trim_end()
        .to_string();
        debug!("Hook responded with {}", reason);

        if !status.is_success() {
            return Err(ClientError::api_error(status.as_u16(), reason));
        }

        Ok(HookResponse {
            status: status.as_u16(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::serve_once;
    use serde_json::json;

    #[tokio::test]
    async fn test_post_json_success() {
        let (port, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let client = HookClient::new(Duration::from_secs(5)).unwrap();

        let response = client
            .post_json(
                &format!("http://127.0.0.1:{}/hook", port),
                &json!({"id": "deploy-1"}),
                false,
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "200 OK");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook HTTP/1.1"));
        assert!(request.contains("deploy-1"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
    }

    #[tokio::test]
    async fn test_post_json_gone() {
        let (port, server) =
            serve_once("HTTP/1.1 410 Gone\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let client = HookClient::new(Duration::from_secs(5)).unwrap();

        let err = client
            .post_json(&format!("http://127.0.0.1:{}/", port), &json!({}), true)
            .await
            .unwrap_err();

        assert!(err.is_gone());
        server.await.unwrap();
    }
}
