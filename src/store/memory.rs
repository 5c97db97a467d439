//! In-memory [`TokenStore`] used in tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TokenStore;

/// Hash-per-key store backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn hash_get_all(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> anyhow::Result<()> {
        let mut hashes = self.hashes.write().await;
        hashes.entry(key.to_string()).or_default().extend(fields);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut hashes = self.hashes.write().await;
        hashes.remove(key);
        Ok(())
    }
}
