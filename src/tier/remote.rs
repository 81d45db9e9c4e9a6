//! Distributed tier (L2).
//!
//! An optional shared key-value store reached over the network. The
//! store itself is behind the [`RemoteStore`] trait so deployments can
//! swap implementations and tests can inject mocks; the bundled
//! [`HttpRemoteStore`] talks to any HTTP KV service that maps keys to
//! paths.
//!
//! Every operation through [`RemoteTier`] is bounded by the configured
//! timeout. A timeout or transport error marks the tier unavailable for
//! that single operation only; the caller falls through to the durable
//! tier without retrying. Entries expire via the TTL attached to each
//! write; this tier is never enumerated or purged locally.

use crate::config::RemoteTierConfig;
use crate::error::{RemoteError, TierError};
use crate::key::CacheKey;
use crate::tier::BoxFuture;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Abstraction over the shared key-value store.
///
/// Object-safe so the tier can hold `Arc<dyn RemoteStore>`; async
/// methods therefore return boxed futures.
pub trait RemoteStore: Send + Sync {
    /// Fetches the bytes for a key, or `None` when absent.
    fn get_bytes(&self, key: &CacheKey) -> BoxFuture<'_, Result<Option<Bytes>, RemoteError>>;

    /// Stores bytes under a key with a time-to-live after which the
    /// store drops the entry on its own.
    fn set_with_ttl(
        &self,
        key: &CacheKey,
        content: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), RemoteError>>;
}

/// HTTP implementation of [`RemoteStore`].
///
/// `GET {base}/{key}` returns the content (404 means absent);
/// `PUT {base}/{key}` stores it with the TTL in the `x-ttl-seconds`
/// header.
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteStore {
    /// Creates a store client against the given base URL.
    ///
    /// The connection pool is kept warm: lookups arrive in bursts when
    /// a render batch misses L1.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RemoteError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn key_url(&self, key: &CacheKey) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

impl RemoteStore for HttpRemoteStore {
    fn get_bytes(&self, key: &CacheKey) -> BoxFuture<'_, Result<Option<Bytes>, RemoteError>> {
        let url = self.key_url(key);
        Box::pin(async move {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| RemoteError::Http(format!("Request failed: {e}")))?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(RemoteError::Status {
                    code: response.status().as_u16(),
                });
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| RemoteError::Http(format!("Failed to read response: {e}")))?;
            Ok(Some(bytes))
        })
    }

    fn set_with_ttl(
        &self,
        key: &CacheKey,
        content: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), RemoteError>> {
        let url = self.key_url(key);
        Box::pin(async move {
            let response = self
                .client
                .put(&url)
                .header("x-ttl-seconds", ttl.as_secs())
                .body(content)
                .send()
                .await
                .map_err(|e| RemoteError::Http(format!("Request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(RemoteError::Status {
                    code: response.status().as_u16(),
                });
            }
            Ok(())
        })
    }
}

/// The L2 tier: a [`RemoteStore`] plus the TTL and timeout policy.
pub struct RemoteTier {
    store: Arc<dyn RemoteStore>,
    ttl: Duration,
    op_timeout: Duration,
}

impl RemoteTier {
    pub fn new(store: Arc<dyn RemoteStore>, config: &RemoteTierConfig) -> Self {
        Self {
            store,
            ttl: config.ttl,
            op_timeout: config.op_timeout,
        }
    }

    /// Fetches a key, bounded by the per-operation timeout.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, TierError> {
        let result = tokio::time::timeout(self.op_timeout, self.store.get_bytes(key))
            .await
            .map_err(|_| TierError::Timeout(self.op_timeout))?;
        let content = result.map_err(TierError::Remote)?;
        trace!(tier = "remote", key = %key, hit = content.is_some(), "Remote lookup");
        Ok(content)
    }

    /// Stores a key with the configured TTL, bounded by the
    /// per-operation timeout.
    pub async fn put(&self, key: &CacheKey, content: Bytes) -> Result<(), TierError> {
        let result = tokio::time::timeout(
            self.op_timeout,
            self.store.set_with_ttl(key, content, self.ttl),
        )
        .await
        .map_err(|_| TierError::Timeout(self.op_timeout))?;
        result.map_err(TierError::Remote)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-memory [`RemoteStore`] for tests. Records operation counts so
    /// tests can assert which tiers were touched.
    #[derive(Default)]
    pub struct MockRemoteStore {
        entries: Mutex<HashMap<String, Bytes>>,
        pub gets: AtomicU64,
        pub sets: AtomicU64,
    }

    impl MockRemoteStore {
        pub fn contains(&self, key: &CacheKey) -> bool {
            self.entries.lock().unwrap().contains_key(key.as_str())
        }
    }

    impl RemoteStore for MockRemoteStore {
        fn get_bytes(&self, key: &CacheKey) -> BoxFuture<'_, Result<Option<Bytes>, RemoteError>> {
            self.gets.fetch_add(1, Ordering::Relaxed);
            let result = self.entries.lock().unwrap().get(key.as_str()).cloned();
            Box::pin(async move { Ok(result) })
        }

        fn set_with_ttl(
            &self,
            key: &CacheKey,
            content: Bytes,
            _ttl: Duration,
        ) -> BoxFuture<'_, Result<(), RemoteError>> {
            self.sets.fetch_add(1, Ordering::Relaxed);
            self.entries
                .lock()
                .unwrap()
                .insert(key.as_str().to_string(), content);
            Box::pin(async move { Ok(()) })
        }
    }

    /// [`RemoteStore`] that fails every operation.
    pub struct FailingRemoteStore;

    impl RemoteStore for FailingRemoteStore {
        fn get_bytes(&self, _key: &CacheKey) -> BoxFuture<'_, Result<Option<Bytes>, RemoteError>> {
            Box::pin(async { Err(RemoteError::Unavailable("store offline".to_string())) })
        }

        fn set_with_ttl(
            &self,
            _key: &CacheKey,
            _content: Bytes,
            _ttl: Duration,
        ) -> BoxFuture<'_, Result<(), RemoteError>> {
            Box::pin(async { Err(RemoteError::Unavailable("store offline".to_string())) })
        }
    }

    /// [`RemoteStore`] that never answers within a test-sized timeout.
    pub struct SlowRemoteStore {
        pub delay: Duration,
    }

    impl RemoteStore for SlowRemoteStore {
        fn get_bytes(&self, _key: &CacheKey) -> BoxFuture<'_, Result<Option<Bytes>, RemoteError>> {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(None)
            })
        }

        fn set_with_ttl(
            &self,
            _key: &CacheKey,
            _content: Bytes,
            _ttl: Duration,
        ) -> BoxFuture<'_, Result<(), RemoteError>> {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    fn tier_with(store: Arc<dyn RemoteStore>, timeout_ms: u64) -> RemoteTier {
        let mut config = RemoteTierConfig::new("http://test.invalid");
        config.op_timeout = Duration::from_millis(timeout_ms);
        RemoteTier::new(store, &config)
    }

    fn test_key(label: &str) -> CacheKey {
        crate::key::derive_key(label, 64, 64, &crate::key::RenderOptions::new()).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_through_mock_store() {
        let store = Arc::new(MockRemoteStore::default());
        let tier = tier_with(store.clone(), 1000);
        let key = test_key("a.svg");

        tier.put(&key, Bytes::from_static(b"artifact")).await.unwrap();
        let content = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(content.as_ref(), b"artifact");
        assert_eq!(store.gets.load(Ordering::Relaxed), 1);
        assert_eq!(store.sets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_absent_key_is_none_not_error() {
        let tier = tier_with(Arc::new(MockRemoteStore::default()), 1000);
        let result = tier.get(&test_key("missing.svg")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_remote_error() {
        let tier = tier_with(Arc::new(FailingRemoteStore), 1000);
        let err = tier.get(&test_key("a.svg")).await.unwrap_err();
        assert!(matches!(err, TierError::Remote(_)));
        let err = tier
            .put(&test_key("a.svg"), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TierError::Remote(_)));
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = Arc::new(SlowRemoteStore {
            delay: Duration::from_millis(200),
        });
        let tier = tier_with(store, 20);
        let err = tier.get(&test_key("a.svg")).await.unwrap_err();
        assert!(matches!(err, TierError::Timeout(_)));
    }

    #[test]
    fn test_key_url_joins_without_double_slash() {
        let store = HttpRemoteStore::new("http://kv.internal:7700/").unwrap();
        let key = test_key("a.svg");
        let url = store.key_url(&key);
        assert_eq!(url, format!("http://kv.internal:7700/{key}"));
        assert!(!url.contains("//a"));
    }
}
