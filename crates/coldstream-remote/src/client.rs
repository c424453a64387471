//! Object store client trait and in-memory implementation
//!
//! The trait moves opaque byte blobs under string keys. Transient
//! failures are reported as `Error::RemoteIo`/`Error::RemoteTimeout` so
//! the retry layer can distinguish them from terminal ones.

use async_trait::async_trait;
use bytes::Bytes;
use coldstream_common::{Error, RemoteKey, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Client for a remote object store
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Store `payload` under `key`, overwriting any existing object.
    async fn put(&self, key: &RemoteKey, payload: Bytes) -> Result<()>;

    /// Fetch the object under `key`.
    async fn get(&self, key: &RemoteKey) -> Result<Bytes>;

    /// Delete the object under `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &RemoteKey) -> Result<()>;

    /// Check whether an object exists without fetching it.
    async fn exists(&self, key: &RemoteKey) -> Result<bool>;

    /// List keys under `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteKey>>;
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, Bytes>,
    /// Remaining injected failures per key prefix
    put_failures: HashMap<String, u32>,
    delete_failures: HashMap<String, u32>,
}

/// In-memory object store used by tests and by remote-sourced reuploads
/// in unit-test setups. Supports injecting a number of transient failures
/// per key so retry behavior can be exercised.
#[derive(Default)]
pub struct MemoryObjectStore {
    state: RwLock<MemoryState>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` puts whose key starts with `prefix` fail.
    pub fn fail_next_puts(&self, prefix: impl Into<String>, count: u32) {
        self.state.write().put_failures.insert(prefix.into(), count);
    }

    /// Make the next `count` deletes whose key starts with `prefix` fail.
    pub fn fail_next_deletes(&self, prefix: impl Into<String>, count: u32) {
        self.state
            .write()
            .delete_failures
            .insert(prefix.into(), count);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }

    /// Snapshot of all stored keys, ordered.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.read().objects.keys().cloned().collect()
    }

    fn take_failure(failures: &mut HashMap<String, u32>, key: &str) -> bool {
        let hit = failures
            .iter_mut()
            .find(|(prefix, count)| key.starts_with(prefix.as_str()) && **count > 0)
            .map(|(_, count)| *count -= 1)
            .is_some();
        failures.retain(|_, count| *count > 0);
        hit
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn put(&self, key: &RemoteKey, payload: Bytes) -> Result<()> {
        let mut state = self.state.write();
        if Self::take_failure(&mut state.put_failures, key.as_str()) {
            return Err(Error::RemoteIo(format!("injected put failure: {key}")));
        }
        state.objects.insert(key.as_str().to_string(), payload);
        Ok(())
    }

    async fn get(&self, key: &RemoteKey) -> Result<Bytes> {
        self.state
            .read()
            .objects
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| Error::RemoteNotFound(key.as_str().to_string()))
    }

    async fn delete(&self, key: &RemoteKey) -> Result<()> {
        let mut state = self.state.write();
        if Self::take_failure(&mut state.delete_failures, key.as_str()) {
            return Err(Error::RemoteIo(format!("injected delete failure: {key}")));
        }
        state.objects.remove(key.as_str());
        Ok(())
    }

    async fn exists(&self, key: &RemoteKey) -> Result<bool> {
        Ok(self.state.read().objects.contains_key(key.as_str()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteKey>> {
        Ok(self
            .state
            .read()
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| RemoteKey::new(k.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryObjectStore::new();
        let key = RemoteKey::new("a/b/c");

        store.put(&key, Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"payload"));
        assert!(store.exists(&key).await.unwrap());

        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
        assert!(matches!(
            store.get(&key).await,
            Err(Error::RemoteNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryObjectStore::new();
        store.delete(&RemoteKey::new("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["x/1", "x/2", "y/1"] {
            store
                .put(&RemoteKey::new(key), Bytes::from_static(b""))
                .await
                .unwrap();
        }
        let listed = store.list("x/").await.unwrap();
        assert_eq!(
            listed,
            vec![RemoteKey::new("x/1"), RemoteKey::new("x/2")]
        );
    }

    #[tokio::test]
    async fn test_injected_put_failures() {
        let store = MemoryObjectStore::new();
        let key = RemoteKey::new("seg/0");
        store.fail_next_puts("seg/", 2);

        assert!(store.put(&key, Bytes::new()).await.is_err());
        assert!(store.put(&key, Bytes::new()).await.is_err());
        assert!(store.put(&key, Bytes::new()).await.is_ok());
    }
}
