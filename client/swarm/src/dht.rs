//! Provider-record DHT contract.
//!
//! The embedded DHT is an external collaborator; the proxy only needs
//! provider records keyed `/pkg/<hex>`. [`MemoryDht`] implements the
//! contract for tests and single-node operation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use dsc_common::{Multiaddr, PeerId, PeerInfo};

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("dht lookup failed: {0}")]
    Lookup(String),
    #[error("dht publish failed: {0}")]
    Publish(String),
    #[error("dht bootstrap failed: {0}")]
    Bootstrap(String),
}

#[async_trait]
pub trait ProviderDht: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Publish a provider record for `key` pointing at this node.
    async fn provide(&self, key: &str) -> Result<(), DhtError>;

    /// Up to `limit` providers of `key`. Callers filter out the local
    /// peer and strip private addresses before acting on the result.
    async fn find_providers(&self, key: &str, limit: usize) -> Result<Vec<PeerInfo>, DhtError>;

    async fn bootstrap(&self) -> Result<(), DhtError>;
}

pub struct MemoryDht {
    local_peer: PeerId,
    local_addrs: Vec<Multiaddr>,
    records: RwLock<HashMap<String, Vec<PeerInfo>>>,
}

impl MemoryDht {
    pub fn new(local_peer: PeerId, local_addrs: Vec<Multiaddr>) -> Self {
        Self {
            local_peer,
            local_addrs,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a provider record, as another node's announce would.
    pub fn insert_provider(&self, key: &str, info: PeerInfo) {
        let mut records = self.records.write();
        let providers = records.entry(key.to_owned()).or_default();
        providers.retain(|existing| existing.peer_id != info.peer_id);
        providers.push(info);
    }

    pub fn providers(&self, key: &str) -> Vec<PeerInfo> {
        self.records.read().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ProviderDht for MemoryDht {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer.clone()
    }

    async fn provide(&self, key: &str) -> Result<(), DhtError> {
        self.insert_provider(
            key,
            PeerInfo::new(self.local_peer.clone(), self.local_addrs.clone()),
        );
        Ok(())
    }

    async fn find_providers(&self, key: &str, limit: usize) -> Result<Vec<PeerInfo>, DhtError> {
        let mut providers = self.providers(key);
        providers.truncate(limit);
        Ok(providers)
    }

    async fn bootstrap(&self) -> Result<(), DhtError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> PeerInfo {
        PeerInfo::new(
            PeerId::from(id),
            vec![Multiaddr::parse("/ip4/203.0.113.1/tcp/4001")],
        )
    }

    #[tokio::test]
    async fn provide_then_find() {
        let dht = MemoryDht::new(PeerId::from("self"), vec![]);
        dht.provide("/pkg/abc").await.unwrap();
        let providers = dht.find_providers("/pkg/abc", 10).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, PeerId::from("self"));
    }

    #[tokio::test]
    async fn find_respects_limit() {
        let dht = MemoryDht::new(PeerId::from("self"), vec![]);
        for i in 0..5 {
            dht.insert_provider("/pkg/abc", info(&format!("peer-{i}")));
        }
        let providers = dht.find_providers("/pkg/abc", 3).await.unwrap();
        assert_eq!(providers.len(), 3);
    }

    #[tokio::test]
    async fn reprovide_replaces_not_duplicates() {
        let dht = MemoryDht::new(PeerId::from("self"), vec![]);
        dht.provide("/pkg/abc").await.unwrap();
        dht.provide("/pkg/abc").await.unwrap();
        assert_eq!(dht.providers("/pkg/abc").len(), 1);
    }
}
