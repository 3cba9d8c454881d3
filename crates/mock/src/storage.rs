//! In-memory secret-key store

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use peervault_core::{Result, SecretStore};

/// Keeps the secret key in memory. Clones share the same slot, so a
/// transport torn down and re-initialized against the same store keeps its
/// identity.
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    slot: Arc<StdMutex<Option<Vec<u8>>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the stored blob (tests use this to exercise the
    /// wrong-length recovery path).
    pub fn seed(&self, bytes: Vec<u8>) {
        *self.slot.lock().expect("store lock") = Some(bytes);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn load_secret_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.slot.lock().expect("store lock").clone())
    }

    async fn save_secret_key(&self, key: &[u8]) -> Result<()> {
        *self.slot.lock().expect("store lock") = Some(key.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let store = MemorySecretStore::new();
        assert!(store.load_secret_key().await.unwrap().is_none());

        store.save_secret_key(&[7u8; 32]).await.unwrap();
        assert_eq!(store.load_secret_key().await.unwrap(), Some(vec![7u8; 32]));
    }

    #[tokio::test]
    async fn clones_share_the_slot() {
        let store = MemorySecretStore::new();
        let clone = store.clone();
        store.save_secret_key(&[1u8; 32]).await.unwrap();
        assert_eq!(clone.load_secret_key().await.unwrap(), Some(vec![1u8; 32]));
    }
}
