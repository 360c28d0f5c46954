use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use juice_core::error::JuiceError;
use juice_core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A signed opaque attestation envelope as replicated by the DHT. The
/// core never interprets `value` beyond its own receipt formats.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttestationEnvelope {
    /// Attestation id (DHT key).
    pub key: String,
    /// Signed opaque payload.
    pub value: Vec<u8>,
    /// Geospatial shard: Google S2 cell id.
    pub s2_cell_id: u64,
    pub valid_from_ms: TimestampMs,
    pub valid_until_ms: TimestampMs,
    /// Optional revocation certificate superseding this attestation.
    pub revocation: Option<Vec<u8>>,
}

impl AttestationEnvelope {
    pub fn is_valid_at(&self, now: TimestampMs) -> bool {
        self.revocation.is_none() && self.valid_from_ms <= now && now < self.valid_until_ms
    }
}

/// Query filter for the replicated store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttestationQuery {
    pub key_prefix: String,
    pub s2_cell_id: Option<u64>,
    pub max_results: usize,
    /// Continuation token from a previous page.
    pub continuation: Option<String>,
}

/// One page of query results plus the continuation token for the next.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryPage {
    pub envelopes: Vec<AttestationEnvelope>,
    pub continuation: Option<String>,
}

/// The geospatially-sharded publish/query interface the core consumes.
/// Implementations provide their own (eventual, TTL-bounded) consistency;
/// every call is a suspension point.
#[async_trait]
pub trait AttestationStore: Send + Sync {
    async fn publish(
        &self,
        key: &str,
        value: Vec<u8>,
        s2_cell_id: u64,
        ttl_seconds: u64,
        replication_factor: u8,
    ) -> Result<(), JuiceError>;

    async fn query(&self, filter: &AttestationQuery) -> Result<QueryPage, JuiceError>;
}

// ── MemoryDht ────────────────────────────────────────────────────────────────

/// In-process store for tests and single-node operation. Respects TTL and
/// prefix/shard filters but replicates nowhere.
#[derive(Default)]
pub struct MemoryDht {
    entries: Mutex<BTreeMap<String, AttestationEnvelope>>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> TimestampMs {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

#[async_trait]
impl AttestationStore for MemoryDht {
    async fn publish(
        &self,
        key: &str,
        value: Vec<u8>,
        s2_cell_id: u64,
        ttl_seconds: u64,
        _replication_factor: u8,
    ) -> Result<(), JuiceError> {
        let now = Self::now_ms();
        let envelope = AttestationEnvelope {
            key: key.to_string(),
            value,
            s2_cell_id,
            valid_from_ms: now,
            valid_until_ms: now + ttl_seconds * 1_000,
            revocation: None,
        };
        debug!(key, s2_cell_id, ttl_seconds, "attestation published");
        self.entries
            .lock()
            .expect("dht lock")
            .insert(key.to_string(), envelope);
        Ok(())
    }

    async fn query(&self, filter: &AttestationQuery) -> Result<QueryPage, JuiceError> {
        let now = Self::now_ms();
        let entries = self.entries.lock().expect("dht lock");
        let max = if filter.max_results == 0 {
            usize::MAX
        } else {
            filter.max_results
        };

        let start = filter
            .continuation
            .clone()
            .unwrap_or_else(|| filter.key_prefix.clone());
        let mut envelopes = Vec::new();
        let mut continuation = None;
        for (key, envelope) in entries.range(start..) {
            if !key.starts_with(&filter.key_prefix) {
                break;
            }
            if filter.continuation.as_deref() == Some(key.as_str()) {
                continue; // The continuation token names the last seen key.
            }
            if let Some(cell) = filter.s2_cell_id {
                if envelope.s2_cell_id != cell {
                    continue;
                }
            }
            if !envelope.is_valid_at(now) {
                continue;
            }
            if envelopes.len() == max {
                continuation = Some(envelopes
                    .last()
                    .map(|e: &AttestationEnvelope| e.key.clone())
                    .unwrap_or_default());
                break;
            }
            envelopes.push(envelope.clone());
        }
        Ok(QueryPage {
            envelopes,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_query_by_prefix() {
        let dht = MemoryDht::new();
        dht.publish("tx/abc/finalization", b"sig".to_vec(), 42, 300, 3)
            .await
            .unwrap();
        dht.publish("tx/abc/commitment", b"sig".to_vec(), 42, 300, 3)
            .await
            .unwrap();
        dht.publish("trust/xyz", b"attest".to_vec(), 42, 300, 3)
            .await
            .unwrap();

        let page = dht
            .query(&AttestationQuery {
                key_prefix: "tx/abc/".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.envelopes.len(), 2);
        assert!(page.continuation.is_none());
    }

    #[tokio::test]
    async fn shard_filter_applies() {
        let dht = MemoryDht::new();
        dht.publish("a/1", vec![], 1, 300, 3).await.unwrap();
        dht.publish("a/2", vec![], 2, 300, 3).await.unwrap();

        let page = dht
            .query(&AttestationQuery {
                key_prefix: "a/".into(),
                s2_cell_id: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.envelopes.len(), 1);
        assert_eq!(page.envelopes[0].key, "a/2");
    }

    #[tokio::test]
    async fn expired_entries_invisible() {
        let dht = MemoryDht::new();
        dht.publish("t/1", vec![], 1, 0, 3).await.unwrap();
        let page = dht
            .query(&AttestationQuery {
                key_prefix: "t/".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(page.envelopes.is_empty(), "ttl 0 expires immediately");
    }

    #[tokio::test]
    async fn pagination_continues() {
        let dht = MemoryDht::new();
        for n in 0..5 {
            dht.publish(&format!("p/{n}"), vec![], 1, 300, 3).await.unwrap();
        }
        let first = dht
            .query(&AttestationQuery {
                key_prefix: "p/".into(),
                max_results: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.envelopes.len(), 2);
        let token = first.continuation.clone().expect("more pages");

        let second = dht
            .query(&AttestationQuery {
                key_prefix: "p/".into(),
                max_results: 10,
                continuation: Some(token),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.envelopes.len(), 3);
    }

    #[test]
    fn revoked_envelope_invalid() {
        let e = AttestationEnvelope {
            key: "k".into(),
            value: vec![],
            s2_cell_id: 0,
            valid_from_ms: 0,
            valid_until_ms: u64::MAX,
            revocation: Some(vec![1]),
        };
        assert!(!e.is_valid_at(1_000));
    }
}
