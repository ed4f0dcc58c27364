use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::Credential;

/// Credential storage. Secure at-rest storage belongs to the implementation.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Key ids for a provider, default key first
    async fn list_keys_for_provider(&self, provider: &str) -> Vec<String>;

    async fn get_key(&self, id: &str) -> Option<Credential>;

    /// Marks a key as the provider's default; false if the key is unknown
    async fn set_default(&self, id: &str) -> bool;

    async fn delete(&self, id: &str) -> bool;
}

#[derive(Debug, Default)]
struct Inner {
    /// Insertion order
    credentials: Vec<Credential>,
    defaults: HashMap<String, String>,
    /// Last suffix issued per provider; ids are never reused after a delete
    issued: HashMap<String, usize>,
}

/// Process-local credential store, seeded from configuration
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Inner>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a provider's keys, naming them `{provider}-{n}`
    pub fn with_keys(provider: &str, secrets: &[String]) -> Self {
        let store = Self::new();
        for secret in secrets {
            store.insert(provider, secret.clone());
        }
        store
    }

    /// Adds a credential and returns its id
    pub fn insert(&self, provider: &str, secret: String) -> String {
        let mut inner = self.inner.write();
        let n = inner.issued.entry(provider.to_string()).or_default();
        *n += 1;
        let id = format!("{}-{}", provider, n);
        inner.credentials.push(Credential {
            id: id.clone(),
            provider: provider.to_string(),
            secret,
        });
        id
    }

    pub fn default_for(&self, provider: &str) -> Option<String> {
        self.inner.read().defaults.get(provider).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn list_keys_for_provider(&self, provider: &str) -> Vec<String> {
        let inner = self.inner.read();
        let default = inner.defaults.get(provider);
        let mut ids: Vec<String> = inner
            .credentials
            .iter()
            .filter(|c| c.provider == provider)
            .map(|c| c.id.clone())
            .collect();
        if let Some(pos) = default.and_then(|d| ids.iter().position(|id| id == d)) {
            let id = ids.remove(pos);
            ids.insert(0, id);
        }
        ids
    }

    async fn get_key(&self, id: &str) -> Option<Credential> {
        self.inner
            .read()
            .credentials
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    async fn set_default(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(provider) = inner
            .credentials
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.provider.clone())
        else {
            return false;
        };
        inner.defaults.insert(provider, id.to_string());
        true
    }

    async fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let before = inner.credentials.len();
        inner.credentials.retain(|c| c.id != id);
        inner.defaults.retain(|_, default| default.as_str() != id);
        inner.credentials.len() != before
    }
}
