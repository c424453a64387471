//! Retry policy, retry chains and the retrying remote facade
//!
//! Every logical remote operation runs under a `RetryChain` node. Chains
//! form a tree through `child()`: cancelling a node cancels its subtree,
//! which lets a caller scope cancellation of an upload it initiated. The
//! `LazyAbort` predicate is consulted before every attempt so an operation
//! stops retrying as soon as the worker pauses, loses leadership or shuts
//! down.

use crate::client::ObjectStoreClient;
use bytes::Bytes;
use coldstream_common::{DownloadResult, Error, RemoteKey, Result, UploadResult};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff with full jitter
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given attempt (1-based), jittered over the full range.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let jittered = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}

/// Node in the cancellation tree under which remote operations run
#[derive(Clone)]
pub struct RetryChain {
    token: CancellationToken,
}

impl RetryChain {
    /// Root of a new chain.
    #[must_use]
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Child node: cancelled when this node is cancelled, cancellable on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for RetryChain {
    fn default() -> Self {
        Self::root()
    }
}

type AbortPredicate = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// Abort predicate consulted before every retry attempt
///
/// Returning a reason converts the in-flight operation to `Cancelled`
/// instead of letting it retry.
pub struct LazyAbort {
    predicate: AbortPredicate,
}

impl LazyAbort {
    pub fn new(predicate: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }

    /// An abort source that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::new(|| None)
    }

    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        (self.predicate)()
    }
}

/// Retrying facade over an object store client
///
/// Classifies outcomes into the result enums the probe reports: transient
/// errors retry up to the policy budget and then count as failed (or timed
/// out); cancellation and abort reasons count as cancelled.
#[derive(Clone)]
pub struct Remote {
    client: Arc<dyn ObjectStoreClient>,
    policy: RetryPolicy,
}

impl Remote {
    pub fn new(client: Arc<dyn ObjectStoreClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ObjectStoreClient> {
        &self.client
    }

    /// PUT `payload` under `key`, retrying transient failures.
    pub async fn upload_object(
        &self,
        chain: &RetryChain,
        abort: &LazyAbort,
        key: &RemoteKey,
        payload: Bytes,
    ) -> UploadResult {
        let mut attempt = 0u32;
        loop {
            if let Some(result) = self.check_aborted(chain, abort, key) {
                return result;
            }
            match self.client.put(key, payload.clone()).await {
                Ok(()) => {
                    debug!(%key, size = payload.len(), "uploaded object");
                    return UploadResult::Success;
                }
                Err(e) => match self.classify_put(chain, key, e, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                },
            }
        }
    }

    /// GET the object under `key`, retrying transient failures. A missing
    /// object is reported as `NotFound`, not retried.
    pub async fn download_object(
        &self,
        chain: &RetryChain,
        abort: &LazyAbort,
        key: &RemoteKey,
    ) -> (DownloadResult, Option<Bytes>) {
        let mut attempt = 0u32;
        loop {
            if self.check_aborted(chain, abort, key).is_some() {
                return (DownloadResult::Cancelled, None);
            }
            match self.client.get(key).await {
                Ok(payload) => return (DownloadResult::Success, Some(payload)),
                Err(Error::RemoteNotFound(_)) => return (DownloadResult::NotFound, None),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    if !self.backoff_or_cancelled(chain, key, &e, attempt).await {
                        return (DownloadResult::Cancelled, None);
                    }
                }
                Err(e) => {
                    warn!(%key, error = %e, "download failed");
                    return (DownloadResult::Failed, None);
                }
            }
        }
    }

    /// DELETE the object under `key`, retrying transient failures.
    pub async fn delete_object(
        &self,
        chain: &RetryChain,
        abort: &LazyAbort,
        key: &RemoteKey,
    ) -> UploadResult {
        let mut attempt = 0u32;
        loop {
            if let Some(result) = self.check_aborted(chain, abort, key) {
                return result;
            }
            match self.client.delete(key).await {
                Ok(()) => return UploadResult::Success,
                Err(e) => match self.classify_put(chain, key, e, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                },
            }
        }
    }

    /// HEAD-style existence check, retried.
    pub async fn object_exists(&self, chain: &RetryChain, key: &RemoteKey) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            if chain.is_cancelled() {
                return Err(Error::Cancelled("exists check".to_string()));
            }
            match self.client.exists(key).await {
                Ok(exists) => return Ok(exists),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    if !self.backoff_or_cancelled(chain, key, &e, attempt).await {
                        return Err(Error::Cancelled("exists check".to_string()));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// List keys under a prefix, retried.
    pub async fn list_objects(&self, chain: &RetryChain, prefix: &str) -> Result<Vec<RemoteKey>> {
        let mut attempt = 0u32;
        loop {
            if chain.is_cancelled() {
                return Err(Error::Cancelled("list".to_string()));
            }
            match self.client.list(prefix).await {
                Ok(keys) => return Ok(keys),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let backoff = self.policy.backoff(attempt);
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = chain.token().cancelled() => {
                            return Err(Error::Cancelled("list".to_string()));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_aborted(
        &self,
        chain: &RetryChain,
        abort: &LazyAbort,
        key: &RemoteKey,
    ) -> Option<UploadResult> {
        if chain.is_cancelled() {
            debug!(%key, "operation cancelled");
            return Some(UploadResult::Cancelled);
        }
        if let Some(reason) = abort.abort_reason() {
            debug!(%key, reason, "operation aborted");
            return Some(UploadResult::Cancelled);
        }
        None
    }

    /// Handle a PUT/DELETE error: `None` means retry, `Some` is terminal.
    async fn classify_put(
        &self,
        chain: &RetryChain,
        key: &RemoteKey,
        error: Error,
        attempt: &mut u32,
    ) -> Option<UploadResult> {
        if error.is_transient() && *attempt < self.policy.max_retries {
            *attempt += 1;
            if self.backoff_or_cancelled(chain, key, &error, *attempt).await {
                return None;
            }
            return Some(UploadResult::Cancelled);
        }
        warn!(%key, error = %error, attempts = *attempt + 1, "remote operation failed");
        match error {
            Error::RemoteTimeout(_) => Some(UploadResult::Timeout),
            _ => Some(UploadResult::Failed),
        }
    }

    /// Sleep the backoff for `attempt`; false when cancelled during the sleep.
    async fn backoff_or_cancelled(
        &self,
        chain: &RetryChain,
        key: &RemoteKey,
        error: &Error,
        attempt: u32,
    ) -> bool {
        let backoff = self.policy.backoff(attempt);
        debug!(%key, error = %error, attempt, backoff_ms = backoff.as_millis() as u64, "retrying");
        tokio::select! {
            () = tokio::time::sleep(backoff) => true,
            () = chain.token().cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryObjectStore;

    fn remote(store: Arc<MemoryObjectStore>) -> Remote {
        Remote::new(store, RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        })
    }

    #[tokio::test]
    async fn test_upload_retries_transient_failures() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_next_puts("k", 2);
        let remote = remote(store.clone());

        let result = remote
            .upload_object(
                &RetryChain::root(),
                &LazyAbort::never(),
                &RemoteKey::new("k"),
                Bytes::from_static(b"x"),
            )
            .await;
        assert_eq!(result, UploadResult::Success);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_fails_after_retry_budget() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_next_puts("k", 10);
        let remote = remote(store);

        let result = remote
            .upload_object(
                &RetryChain::root(),
                &LazyAbort::never(),
                &RemoteKey::new("k"),
                Bytes::new(),
            )
            .await;
        assert_eq!(result, UploadResult::Failed);
    }

    #[tokio::test]
    async fn test_lazy_abort_cancels_before_attempt() {
        let store = Arc::new(MemoryObjectStore::new());
        let remote = remote(store.clone());
        let abort = LazyAbort::new(|| Some("paused".to_string()));

        let result = remote
            .upload_object(&RetryChain::root(), &abort, &RemoteKey::new("k"), Bytes::new())
            .await;
        assert_eq!(result, UploadResult::Cancelled);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_chain_cancels_children() {
        let store = Arc::new(MemoryObjectStore::new());
        let remote = remote(store);
        let root = RetryChain::root();
        let child = root.child();
        root.cancel();

        let result = remote
            .upload_object(&child, &LazyAbort::never(), &RemoteKey::new("k"), Bytes::new())
            .await;
        assert_eq!(result, UploadResult::Cancelled);
    }

    #[tokio::test]
    async fn test_download_notfound_is_not_retried() {
        let store = Arc::new(MemoryObjectStore::new());
        let remote = remote(store);

        let (result, payload) = remote
            .download_object(
                &RetryChain::root(),
                &LazyAbort::never(),
                &RemoteKey::new("missing"),
            )
            .await;
        assert_eq!(result, DownloadResult::NotFound);
        assert!(payload.is_none());
    }
}
