//! HTTP pass-through to continuous jobs

use async_trait::async_trait;
use kudu_client::{ClientError, JobEndpointClient};
use kudu_core::dto::proxy::{ProxyRequest, ProxyResponse};

/// Forwards a request to a job listening on a loopback port
#[async_trait]
pub trait JobEndpoint: Send + Sync {
    async fn forward(
        &self,
        port: u16,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, ClientError>;
}

#[async_trait]
impl JobEndpoint for JobEndpointClient {
    async fn forward(
        &self,
        port: u16,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, ClientError> {
        JobEndpointClient::forward(self, port, request).await
    }
}
