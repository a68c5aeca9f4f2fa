//! HTTP pass-through to continuous jobs

use crate::error::{ClientError, Result};
use crate::USER_AGENT;
use kudu_core::dto::proxy::{ProxyRequest, ProxyResponse};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::instrument;

/// Headers that describe the hop rather than the message
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

/// Forwards requests to `http://{host}:{port}/{path}`
#[derive(Debug, Clone)]
pub struct JobEndpointClient {
    client: Client,
    host: String,
}

impl JobEndpointClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            host: "127.0.0.1".to_string(),
        })
    }

    pub fn endpoint_url(&self, port: u16, path: &str) -> String {
        format!(
            "http://{}:{}/{}",
            self.host,
            port,
            path.trim_start_matches('/')
        )
    }

    /// Forward `request` and return whatever the job answered, whatever the status
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn forward(&self, port: u16, request: &ProxyRequest) -> Result<ProxyResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ClientError::InvalidRequest(format!("bad method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, self.endpoint_url(port, &request.path));
        for (name, value) in &request.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
