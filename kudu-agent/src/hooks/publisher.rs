use async_trait::async_trait;
use kudu_client::{ClientError, HookClient, HookResponse};
use kudu_core::domain::deployment::DeploymentStatus;

/// Delivers a deployment notification to one hook address
#[async_trait]
pub trait HookPublisher: Send + Sync {
    async fn publish(
        &self,
        address: &str,
        status: &DeploymentStatus,
        insecure_ssl: bool,
    ) -> Result<HookResponse, ClientError>;
}

#[async_trait]
impl HookPublisher for HookClient {
    async fn publish(
        &self,
        address: &str,
        status: &DeploymentStatus,
        insecure_ssl: bool,
    ) -> Result<HookResponse, ClientError> {
        self.post_json(address, status, insecure_ssl).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Answers with scripted status codes per address; 200 once a script runs out
    #[derive(Debug, Default)]
    pub struct FakePublisher {
        responses: Mutex<HashMap<String, VecDeque<u16>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakePublisher {
        pub fn respond(&self, address: &str, statuses: &[u16]) {
            self.responses
                .lock()
                .unwrap()
                .insert(address.to_string(), statuses.iter().copied().collect());
        }

        /// (address, deployment id) of every attempt
        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn attempts(&self, address: &str) -> usize {
            self.calls()
                .iter()
                .filter(|(called, _)| called == address)
                .count()
        }
    }

    #[async_trait]
    impl HookPublisher for FakePublisher {
        async fn publish(
            &self,
            address: &str,
            status: &DeploymentStatus,
            _insecure_ssl: bool,
        ) -> Result<HookResponse, ClientError> {
            self.calls
                .lock()
                .unwrap()
                .push((address.to_string(), status.id.clone()));
            let code = self
                .responses
                .lock()
                .unwrap()
                .get_mut(address)
                .and_then(VecDeque::pop_front)
                .unwrap_or(200);
            if (200..300).contains(&code) {
                Ok(HookResponse {
                    status: code,
                    reason: format!("{} OK", code),
                })
            } else {
                Err(ClientError::api_error(code, format!("{} Error", code)))
            }
        }
    }
}
