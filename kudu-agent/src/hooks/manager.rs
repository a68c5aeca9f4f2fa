//! Web hook registry
//!
//! The registry is one JSON array in `{root}/data/hooks`. Every read and
//! every read-modify-write happens under the `hooks` operation lock, and the
//! file is replaced atomically, so concurrent agents never lose an update
//! and readers never see a torn file.

use chrono::Utc;
use kudu_client::{ClientError, HookResponse};
use kudu_core::domain::deployment::DeploymentStatus;
use kudu_core::domain::hook::{HookEventType, PublishContext, PublishStatus, WebHook};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::publisher::HookPublisher;
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::fs::{FileSystem, read_optional};
use crate::lock::{OperationLock, lock_operation};

#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Extra attempts after a retryable failure
    pub retries: u32,
    /// Delay before the first retry; doubles on each further one
    pub retry_delay: Duration,
}

impl PublishPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.hook_publish_retries,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Result of delivering one notification
#[derive(Debug)]
enum Delivery {
    Delivered(HookResponse),
    Gone,
    Failed(ClientError),
}

/// Absolute http(s) address with a host
fn validate_address(address: &str) -> Result<()> {
    let invalid = || {
        CoordinatorError::Validation(format!("'{}' is not a valid web hook address", address))
    };
    let url = Url::parse(address).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok(())
}

pub struct WebHooksManager {
    fs: Arc<dyn FileSystem>,
    hooks_file: PathBuf,
    lock: Arc<dyn OperationLock>,
    lock_timeout: Duration,
    publisher: Arc<dyn HookPublisher>,
    policy: PublishPolicy,
}

impl WebHooksManager {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        hooks_file: impl Into<PathBuf>,
        lock: Arc<dyn OperationLock>,
        lock_timeout: Duration,
        publisher: Arc<dyn HookPublisher>,
        policy: PublishPolicy,
    ) -> Self {
        Self {
            fs,
            hooks_file: hooks_file.into(),
            lock,
            lock_timeout,
            publisher,
            policy,
        }
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Registered hooks, as currently persisted
    pub async fn web_hooks(&self) -> Result<Vec<WebHook>> {
        lock_operation(&self.lock, "read hooks", self.lock_timeout, || async move {
            self.read_hooks()
        })
        .await
    }

    pub async fn get_web_hook(&self, id: &str) -> Result<Option<WebHook>> {
        Ok(self
            .web_hooks()
            .await?
            .into_iter()
            .find(|hook| hook.id.eq_ignore_ascii_case(id)))
    }

    /// Register `hook`
    ///
    /// The address is trimmed and must be an absolute http(s) URL; it must
    /// not match a registered address (case-insensitively). An id is
    /// assigned when the hook has none.
    #[instrument(skip(self, hook), fields(address = %hook.hook_address))]
    pub async fn add_web_hook(&self, mut hook: WebHook) -> Result<WebHook> {
        hook.hook_address = hook.hook_address.trim().to_string();
        validate_address(&hook.hook_address)?;

        lock_operation(&self.lock, "add hook", self.lock_timeout, || async move {
            let mut hooks = self.read_hooks()?;
            if hooks.iter().any(|h| h.matches_address(&hook.hook_address)) {
                return Err(CoordinatorError::Conflict(format!(
                    "a web hook for '{}' is already registered",
                    hook.hook_address
                )));
            }
            let taken = hooks.iter().any(|h| h.id.eq_ignore_ascii_case(&hook.id));
            if hook.id.trim().is_empty() || taken {
                hook.id = Uuid::new_v4().simple().to_string();
            }

            hooks.push(hook.clone());
            self.write_hooks(&hooks)?;
            info!(
                "Added web hook {} ({}) for {}",
                hook.id, hook.hook_event_type, hook.hook_address
            );
            Ok(hook)
        })
        .await
    }

    /// Unregister the hook with `id`; unknown ids are ignored
    #[instrument(skip(self))]
    pub async fn remove_web_hook(&self, id: &str) -> Result<()> {
        lock_operation(&self.lock, "remove hook", self.lock_timeout, || async move {
            let mut hooks = self.read_hooks()?;
            let before = hooks.len();
            hooks.retain(|hook| !hook.id.eq_ignore_ascii_case(id));
            if hooks.len() != before {
                self.write_hooks(&hooks)?;
                info!("Removed web hook {}", id);
            } else {
                debug!("No web hook {} to remove", id);
            }
            Ok(())
        })
        .await
    }

    /// Hooks in the file
    ///
    /// A missing, blank or malformed file is an empty registry. Any other
    /// read failure is returned, so callers never write back a registry
    /// they could not load.
    fn read_hooks(&self) -> Result<Vec<WebHook>> {
        let Some(data) = read_optional(self.fs.as_ref(), &self.hooks_file)? else {
            return Ok(Vec::new());
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&data).unwrap_or_else(|e| {
            warn!("Ignoring malformed hooks file {}: {}", self.hooks_file.display(), e);
            Vec::new()
        }))
    }

    fn write_hooks(&self, hooks: &[WebHook]) -> Result<()> {
        let data = serde_json::to_vec_pretty(hooks)?;
        self.fs.write_atomic(&self.hooks_file, &data)?;
        Ok(())
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Notify every `PostDeployment` hook about `status`
    ///
    /// Deliveries run concurrently, retrying transport failures and 5xx
    /// answers. The outcome is recorded on each hook; a hook answering
    /// 410 Gone is unregistered. Failures are logged, never returned.
    /// Returns the number of hooks that accepted the notification.
    #[instrument(skip(self, status), fields(deployment = %status.id))]
    pub async fn publish_post_deployment(&self, status: &DeploymentStatus) -> usize {
        let hooks: Vec<WebHook> = match self.web_hooks().await {
            Ok(hooks) => hooks
                .into_iter()
                .filter(|hook| hook.hook_event_type == HookEventType::PostDeployment)
                .collect(),
            Err(e) => {
                error!("Failed to load web hooks: {}", e);
                return 0;
            }
        };
        if hooks.is_empty() {
            return 0;
        }

        let mut deliveries = JoinSet::new();
        for hook in hooks {
            let publisher = Arc::clone(&self.publisher);
            let policy = self.policy.clone();
            let status = status.clone();
            deliveries.spawn(async move {
                let delivery = deliver(publisher.as_ref(), &policy, &hook, &status).await;
                (hook, delivery)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Web hook delivery task failed: {}", e),
            }
        }

        let delivered = outcomes
            .iter()
            .filter(|(_, delivery)| matches!(delivery, Delivery::Delivered(_)))
            .count();
        if let Err(e) = self.record_outcomes(status, outcomes).await {
            error!("Failed to record web hook results: {}", e);
        }
        delivered
    }

    /// Publish in a background task; the caller never waits on delivery
    pub fn publish_post_deployment_detached(
        self: &Arc<Self>,
        status: DeploymentStatus,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let delivered = manager.publish_post_deployment(&status).await;
            debug!("Deployment {} delivered to {} web hook(s)", status.id, delivered);
        })
    }

    async fn record_outcomes(
        &self,
        status: &DeploymentStatus,
        outcomes: Vec<(WebHook, Delivery)>,
    ) -> Result<()> {
        let context = PublishContext::from(status);
        lock_operation(&self.lock, "record hooks", self.lock_timeout, || async move {
            let mut hooks = self.read_hooks()?;
            let now = Utc::now();
            for (published, delivery) in outcomes {
                let Some(index) = hooks.iter().position(|h| h.id == published.id) else {
                    continue;
                };
                match delivery {
                    Delivery::Delivered(response) => {
                        hooks[index].record_publish(
                            PublishStatus::Success,
                            response.reason,
                            context.clone(),
                            now,
                        );
                    }
                    Delivery::Failed(e) => {
                        hooks[index].record_publish(
                            PublishStatus::Failure,
                            e.to_string(),
                            context.clone(),
                            now,
                        );
                    }
                    Delivery::Gone => {
                        info!(
                            "Web hook {} answered 410 Gone, removing it",
                            published.hook_address
                        );
                        hooks.remove(index);
                    }
                }
            }
            self.write_hooks(&hooks)
        })
        .await
    }
}

async fn deliver(
    publisher: &dyn HookPublisher,
    policy: &PublishPolicy,
    hook: &WebHook,
    status: &DeploymentStatus,
) -> Delivery {
    let mut delay = policy.retry_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match publisher
            .publish(&hook.hook_address, status, hook.insecure_ssl)
            .await
        {
            Ok(response) => {
                debug!("Web hook {} accepted: {}", hook.hook_address, response.reason);
                return Delivery::Delivered(response);
            }
            Err(e) if e.is_gone() => return Delivery::Gone,
            Err(e) if e.is_retryable() && attempt <= policy.retries => {
                debug!(
                    "Web hook {} failed (attempt {}): {}, retrying in {:?}",
                    hook.hook_address, attempt, e, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                warn!("Failed to publish to web hook {}: {}", hook.hook_address, e);
                return Delivery::Failed(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::fs::testing::FaultyFileSystem;
    use crate::hooks::publisher::testing::FakePublisher;
    use crate::lock::LockProvider;
    use crate::lock::testing::TrackingLockProvider;
    use kudu_core::domain::deployment::DeploymentState;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    const HOOKS_FILE: &str = "/site/data/hooks";

    struct Fixture {
        fs: Arc<InMemoryFileSystem>,
        locks: Arc<TrackingLockProvider>,
        publisher: Arc<FakePublisher>,
        manager: Arc<WebHooksManager>,
    }

    fn fixture() -> Fixture {
        let fs = Arc::new(InMemoryFileSystem::new());
        let locks = Arc::new(TrackingLockProvider::default());
        let publisher = Arc::new(FakePublisher::default());
        let manager = Arc::new(WebHooksManager::new(
            fs.clone(),
            HOOKS_FILE,
            locks.get_lock("hooks"),
            Duration::from_secs(5),
            publisher.clone(),
            PublishPolicy {
                retries: 2,
                retry_delay: Duration::from_millis(1),
            },
        ));
        Fixture {
            fs,
            locks,
            publisher,
            manager,
        }
    }

    fn hook(address: &str) -> WebHook {
        WebHook::new(HookEventType::PostDeployment, address)
    }

    async fn addresses(manager: &WebHooksManager) -> Vec<String> {
        manager
            .web_hooks()
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.hook_address)
            .collect()
    }

    #[tokio::test]
    async fn test_add_web_hook() -> Result<()> {
        let f = fixture();

        let added = f
            .manager
            .add_web_hook(hook("  http://www.gothere.com/aaabbbbbbaaa "))
            .await?;

        assert!(!added.id.is_empty());
        assert_eq!(added.hook_address, "http://www.gothere.com/aaabbbbbbaaa");
        let hooks = f.manager.web_hooks().await?;
        assert_eq!(hooks, vec![added.clone()]);
        assert_eq!(f.manager.get_web_hook(&added.id.to_uppercase()).await?, Some(added));
        Ok(())
    }

    #[tokio::test]
    async fn test_three_hooks_remove_middle_then_duplicate() -> Result<()> {
        let f = fixture();
        let first = f.manager.add_web_hook(hook("http://x/a")).await?;
        let second = f.manager.add_web_hook(hook("http://x/b")).await?;
        let third = f.manager.add_web_hook(hook("http://x/c")).await?;
        assert_eq!(f.manager.web_hooks().await?.len(), 3);

        f.manager.remove_web_hook(&second.id).await?;
        assert_eq!(f.manager.web_hooks().await?, vec![first, third]);

        let err = f.manager.add_web_hook(hook("HTTP://X/C")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
        assert_eq!(err.status_code(), 409);
        assert_eq!(addresses(&f.manager).await, vec!["http://x/a", "http://x/c"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_same_address_is_added_once() -> Result<()> {
        let f = fixture();
        for address in ["http://x/a", "http://x/a", "http://x/b", "http://x/b", "http://x/a"] {
            let _ = f.manager.add_web_hook(hook(address)).await;
        }

        assert_eq!(addresses(&f.manager).await, vec!["http://x/a", "http://x/b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_unknown_id_succeeds() -> Result<()> {
        let f = fixture();
        f.manager.remove_web_hook("anything").await?;
        assert!(f.manager.web_hooks().await?.is_empty());

        f.manager.add_web_hook(hook("http://x/a")).await?;
        f.manager.remove_web_hook("anything").await?;
        assert_eq!(f.manager.web_hooks().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_addresses_are_rejected() -> Result<()> {
        let f = fixture();
        for address in ["htsp://\\invalidurl", "not a url", "/relative/path", "ftp://x/a", ""] {
            let err = f.manager.add_web_hook(hook(address)).await.unwrap_err();
            assert!(
                matches!(err, CoordinatorError::Validation(_)),
                "{} was accepted",
                address
            );
            assert_eq!(err.status_code(), 400);
        }

        assert!(f.manager.web_hooks().await?.is_empty());
        assert!(!f.fs.exists(Path::new(HOOKS_FILE)));
        Ok(())
    }

    #[tokio::test]
    async fn test_registry_is_a_json_array() -> Result<()> {
        let f = fixture();
        f.manager
            .add_web_hook(hook("https://x/a").with_id("fixed").with_insecure_ssl(true))
            .await?;

        let value: serde_json::Value = serde_json::from_slice(&f.fs.read(Path::new(HOOKS_FILE))?)?;
        assert_eq!(
            value,
            serde_json::json!([{
                "id": "fixed",
                "event": "PostDeployment",
                "url": "https://x/a",
                "insecureSsl": true
            }])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_file_reads_as_empty() -> Result<()> {
        let f = fixture();
        f.fs.write(Path::new(HOOKS_FILE), b"{not json")?;

        assert!(f.manager.web_hooks().await?.is_empty());
        f.manager.add_web_hook(hook("http://x/a")).await?;
        assert_eq!(f.manager.web_hooks().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_registry_is_left_intact() -> Result<()> {
        let memory = Arc::new(InMemoryFileSystem::new());
        let faults = Arc::new(FaultyFileSystem::new(memory.clone()));
        let locks = TrackingLockProvider::default();
        let manager = WebHooksManager::new(
            faults.clone(),
            HOOKS_FILE,
            locks.get_lock("hooks"),
            Duration::from_secs(5),
            Arc::new(FakePublisher::default()),
            PublishPolicy {
                retries: 0,
                retry_delay: Duration::from_millis(1),
            },
        );
        for address in ["http://x/a", "http://x/b", "http://x/c"] {
            manager.add_web_hook(hook(address)).await?;
        }
        let persisted = memory.read(Path::new(HOOKS_FILE))?;

        faults.deny_reads(HOOKS_FILE);
        let err = manager.add_web_hook(hook("http://x/d")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Unavailable(_)));
        assert_eq!(err.status_code(), 503);
        assert!(manager.remove_web_hook("anything").await.is_err());
        assert!(manager.web_hooks().await.is_err());
        assert_eq!(memory.read(Path::new(HOOKS_FILE))?, persisted);

        faults.allow_reads();
        assert_eq!(
            addresses(&manager).await,
            vec!["http://x/a", "http://x/b", "http://x/c"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_adds_lose_no_updates() {
        let f = fixture();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = Arc::clone(&f.manager);
            tasks.push(tokio::spawn(async move {
                manager.add_web_hook(hook(&format!("http://x/{}", i))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(f.manager.web_hooks().await.unwrap().len(), 16);
        let lock = f.locks.tracking("hooks");
        assert_eq!(lock.max_holders.load(Ordering::SeqCst), 1);
        assert_eq!(lock.holders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_records_results() -> Result<()> {
        let f = fixture();
        let ok = f.manager.add_web_hook(hook("http://x/ok")).await?;
        let flaky = f.manager.add_web_hook(hook("http://x/flaky")).await?;
        let broken = f.manager.add_web_hook(hook("http://x/broken")).await?;
        f.manager.add_web_hook(hook("http://x/gone")).await?;
        f.publisher.respond("http://x/flaky", &[503]);
        f.publisher.respond("http://x/broken", &[500, 500, 500, 500]);
        f.publisher.respond("http://x/gone", &[410]);

        let status = DeploymentStatus::new("deploy-1", DeploymentState::Success);
        let delivered = f.manager.publish_post_deployment(&status).await;

        assert_eq!(delivered, 2);
        assert_eq!(f.publisher.attempts("http://x/ok"), 1);
        assert_eq!(f.publisher.attempts("http://x/flaky"), 2);
        assert_eq!(f.publisher.attempts("http://x/broken"), 3);
        assert_eq!(f.publisher.attempts("http://x/gone"), 1);

        let hooks = f.manager.web_hooks().await?;
        assert_eq!(hooks.len(), 3);
        let find = |id: &str| hooks.iter().find(|h| h.id == id).unwrap();
        assert_eq!(find(&ok.id).last_publish_status, Some(PublishStatus::Success));
        assert_eq!(find(&ok.id).last_publish_reason.as_deref(), Some("200 OK"));
        assert_eq!(find(&flaky.id).last_publish_status, Some(PublishStatus::Success));
        let failed = find(&broken.id);
        assert_eq!(failed.last_publish_status, Some(PublishStatus::Failure));
        assert!(failed.last_publish_reason.as_deref().unwrap().contains("500"));
        assert_eq!(
            failed.last_context.as_ref().unwrap().deployment_id,
            "deploy-1"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_detached_publish() -> Result<()> {
        let f = fixture();
        f.manager.add_web_hook(hook("http://x/a")).await?;

        let handle = f
            .manager
            .publish_post_deployment_detached(DeploymentStatus::new("deploy-2", DeploymentState::Failed));
        handle.await.unwrap();

        assert_eq!(
            f.publisher.calls(),
            vec![("http://x/a".to_string(), "deploy-2".to_string())]
        );
        let hooks = f.manager.web_hooks().await?;
        assert_eq!(hooks[0].last_publish_status, Some(PublishStatus::Success));
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_without_hooks_is_a_no_op() {
        let f = fixture();
        let status = DeploymentStatus::new("deploy-3", DeploymentState::Success);
        assert_eq!(f.manager.publish_post_deployment(&status).await, 0);
        assert!(f.publisher.calls().is_empty());
        assert!(!f.fs.exists(Path::new(HOOKS_FILE)));
    }
}
