//! Key-value persistence for token records.
//!
//! Records are stored as string hashes under one key per user, so partial
//! updates (a refresh rewriting only the access token and expiry) leave the
//! remaining fields intact.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::error::TokenError;

mod memory;

pub use memory::MemoryTokenStore;

/// Store key for a user's Google token hash.
pub fn token_key(user_id: &str) -> String {
    format!("user:{user_id}:google")
}

/// Hash-oriented key-value store, the minimal surface the token lifecycle
/// needs. Implementations map onto Redis-style hash commands.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Returns all fields of the hash at `key`. A missing key yields an
    /// empty map.
    async fn hash_get_all(&self, key: &str) -> anyhow::Result<HashMap<String, String>>;

    /// Writes `fields` into the hash at `key`, merging with any existing
    /// fields. Fields not named in `fields` keep their current values.
    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> anyhow::Result<()>;

    /// Removes the hash at `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

static SHARED_STORE: OnceLock<Arc<dyn TokenStore>> = OnceLock::new();

/// Installs the process-wide store used by [`shared_store`]. Returns false if
/// a store was already installed, in which case the existing one stays.
pub fn init_shared_store(store: Arc<dyn TokenStore>) -> bool {
    SHARED_STORE.set(store).is_ok()
}

/// Returns the process-wide store installed via [`init_shared_store`].
pub fn shared_store() -> Result<Arc<dyn TokenStore>, TokenError> {
    SHARED_STORE
        .get()
        .cloned()
        .ok_or_else(|| TokenError::Configuration("token store is not initialized".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_key_is_namespaced_per_user() {
        assert_eq!(token_key("user-1"), "user:user-1:google");
        assert_ne!(token_key("a"), token_key("b"));
    }
}
