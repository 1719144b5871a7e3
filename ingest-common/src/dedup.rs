use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;

use crate::fingerprint::MessageFingerprint;
use crate::metrics::DEDUP_ERRORS;

pub const DEFAULT_KEY_PREFIX: &str = "telemetry:processed:";

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("timed out waiting for redis after {0:?}")]
    Timeout(Duration),
}

/// A key-value store with expiring keys, shared by every worker and process instance.
/// Implementations must be safe for concurrent use: no local locking is done around them.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, DedupError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DedupError>;
}

pub struct RedisDedupStore {
    client: redis::Client,
    command_timeout: Duration,
}

impl RedisDedupStore {
    pub fn new(addr: &str, command_timeout: Duration) -> Result<Self, DedupError> {
        let client = redis::Client::open(addr)?;

        Ok(Self {
            client,
            command_timeout,
        })
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn exists(&self, key: &str) -> Result<bool, DedupError> {
        let command = async {
            let mut conn = self.client.get_async_connection().await?;
            let exists: bool = conn.exists(key).await?;
            Ok::<bool, redis::RedisError>(exists)
        };

        timeout(self.command_timeout, command)
            .await
            .map_err(|_| DedupError::Timeout(self.command_timeout))?
            .map_err(DedupError::from)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DedupError> {
        let seconds = ttl.as_secs().max(1) as usize;
        let command = async {
            let mut conn = self.client.get_async_connection().await?;
            conn.set_ex::<_, _, ()>(key, value, seconds).await
        };

        timeout(self.command_timeout, command)
            .await
            .map_err(|_| DedupError::Timeout(self.command_timeout))?
            .map_err(DedupError::from)
    }
}

/// Decides whether a message was already processed, based on markers kept in a `DedupStore`.
///
/// The gate fails open: if the store cannot be reached, the message is treated as new.
/// Writing a duplicate point is preferable to dropping data. Markers expire after `ttl`,
/// after which a redelivered message is processed again.
#[derive(Clone)]
pub struct DeduplicationGate {
    store: Arc<dyn DedupStore>,
    key_prefix: String,
    ttl: Duration,
}

impl DeduplicationGate {
    pub fn new(store: Arc<dyn DedupStore>, key_prefix: &str, ttl: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_owned(),
            ttl,
        }
    }

    pub fn key(&self, fingerprint: &MessageFingerprint) -> String {
        format!("{}{}", self.key_prefix, fingerprint)
    }

    pub async fn has_processed(&self, fingerprint: &MessageFingerprint) -> bool {
        match self.store.exists(&self.key(fingerprint)).await {
            Ok(exists) => exists,
            Err(error) => {
                warn!(%fingerprint, "dedup store unavailable, processing message: {}", error);
                metrics::counter!(DEDUP_ERRORS, "operation" => "exists").increment(1);
                false
            }
        }
    }

    /// Record a message as processed. Failures are logged and otherwise ignored.
    pub async fn mark_processed(&self, fingerprint: &MessageFingerprint) {
        if let Err(error) = self
            .store
            .set_with_ttl(&self.key(fingerprint), "1", self.ttl)
            .await
        {
            warn!(%fingerprint, "failed to mark message as processed: {}", error);
            metrics::counter!(DEDUP_ERRORS, "operation" => "set").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::test_utils::MockDedupStore;

    fn gate(store: &MockDedupStore) -> DeduplicationGate {
        DeduplicationGate::new(
            Arc::new(store.clone()),
            DEFAULT_KEY_PREFIX,
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_mark_then_check() {
        let store = MockDedupStore::new();
        let gate = gate(&store);
        let fp = fingerprint(b"payload");

        assert!(!gate.has_processed(&fp).await);
        gate.mark_processed(&fp).await;
        assert!(gate.has_processed(&fp).await);
        assert!(!gate.has_processed(&fingerprint(b"other payload")).await);

        let key = format!("telemetry:processed:{}", fp);
        assert_eq!(store.ttl_of(&key), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_unavailable() {
        let store = MockDedupStore::new();
        let gate = gate(&store);
        let fp = fingerprint(b"payload");

        gate.mark_processed(&fp).await;
        store.set_unavailable(true);

        assert!(!gate.has_processed(&fp).await);
        // Marking does not panic or surface an error either.
        gate.mark_processed(&fingerprint(b"another")).await;
    }

    #[tokio::test]
    async fn test_expired_markers_are_reprocessed() {
        let store = MockDedupStore::new();
        let gate = gate(&store);
        let fp = fingerprint(b"payload");

        gate.mark_processed(&fp).await;
        store.expire_all();

        assert!(!gate.has_processed(&fp).await);
    }
}
