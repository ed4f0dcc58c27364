//! Per-provider credential rotation on quota exhaustion.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::{collections::VecDeque, sync::Arc};

use crate::services::generation::{Credential, CredentialStore};

/// Rotation bookkeeping for one provider.
///
/// `current_key_id` is always in `available_key_ids` unless the provider is
/// blocked, and the used and available sets never overlap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRotationState {
    pub current_key_id: Option<String>,
    /// Exhausted keys in order of exhaustion
    pub used_key_ids: Vec<String>,
    /// FIFO order of election
    pub available_key_ids: VecDeque<String>,
    pub rotation_count: u32,
    pub is_rotation_blocked: bool,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl KeyRotationState {
    fn from_keys(key_ids: Vec<String>) -> Self {
        let mut available = VecDeque::new();
        for id in key_ids {
            if !available.contains(&id) {
                available.push_back(id);
            }
        }
        Self {
            current_key_id: available.front().cloned(),
            is_rotation_blocked: available.is_empty(),
            available_key_ids: available,
            ..Default::default()
        }
    }

    /// Marks the current key exhausted and elects the next one
    fn rotate(&mut self, now: DateTime<Utc>) -> Option<String> {
        if let Some(current) = self.current_key_id.take() {
            self.available_key_ids.retain(|id| *id != current);
            if !self.used_key_ids.contains(&current) {
                self.used_key_ids.push(current);
            }
        }

        match self.available_key_ids.front().cloned() {
            Some(next) => {
                self.current_key_id = Some(next.clone());
                self.rotation_count += 1;
                self.last_rotated_at = Some(now);
                Some(next)
            }
            None => {
                self.is_rotation_blocked = true;
                None
            }
        }
    }

    fn remove(&mut self, key_id: &str) {
        self.available_key_ids.retain(|id| id != key_id);
        self.used_key_ids.retain(|id| id != key_id);

        if self.current_key_id.as_deref() != Some(key_id) {
            return;
        }

        if let Some(next) = self.available_key_ids.front().cloned() {
            self.current_key_id = Some(next);
        } else if !self.used_key_ids.is_empty() {
            // Last resort: give an exhausted key another chance
            let revived = self.used_key_ids.remove(0);
            self.available_key_ids.push_back(revived.clone());
            self.current_key_id = Some(revived);
            self.is_rotation_blocked = false;
        } else {
            self.current_key_id = None;
            self.is_rotation_blocked = true;
        }
    }
}

/// Tracks which credentials of each AI provider are usable.
///
/// Rotation for a provider runs under that provider's map entry lock;
/// credential lookups happen after the lock is released.
pub struct ProviderKeyPool {
    credentials: Arc<dyn CredentialStore>,
    states: DashMap<String, KeyRotationState>,
}

impl ProviderKeyPool {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            states: DashMap::new(),
        }
    }

    pub fn initialize(&self, provider: &str, key_ids: Vec<String>) {
        let state = KeyRotationState::from_keys(key_ids);
        tracing::info!(
            provider = %provider,
            keys = state.available_key_ids.len(),
            "Initialized provider key pool"
        );
        self.states.insert(provider.to_string(), state);
    }

    /// Registers a provider with every key the credential store knows for it
    pub async fn register(&self, provider: &str) -> usize {
        let key_ids = self.credentials.list_keys_for_provider(provider).await;
        let count = key_ids.len();
        self.initialize(provider, key_ids);
        count
    }

    pub async fn get_current_key(&self, provider: &str) -> Option<Credential> {
        let key_id = self.states.get(provider)?.current_key_id.clone()?;
        self.credentials.get_key(&key_id).await
    }

    /// Rotates away from whatever key is current
    pub async fn handle_quota_exceeded(&self, provider: &str) -> Option<Credential> {
        let current = self.states.get(provider)?.current_key_id.clone()?;
        self.handle_quota_exceeded_for(provider, &current).await
    }

    /// Rotates away from `exhausted_key_id`.
    ///
    /// If another request already rotated past that key, the current key is
    /// returned unchanged. Returns `None` once every key is exhausted.
    pub async fn handle_quota_exceeded_for(
        &self,
        provider: &str,
        exhausted_key_id: &str,
    ) -> Option<Credential> {
        let next_id = {
            let mut state = self.states.get_mut(provider)?;
            if state.is_rotation_blocked {
                return None;
            }
            if state.current_key_id.as_deref() == Some(exhausted_key_id) {
                let next = state.rotate(Utc::now());
                match &next {
                    Some(next) => tracing::info!(
                        provider = %provider,
                        exhausted = %exhausted_key_id,
                        next = %next,
                        rotation_count = state.rotation_count,
                        "Rotated provider key after quota exhaustion"
                    ),
                    None => tracing::error!(
                        provider = %provider,
                        "All provider keys exhausted, rotation blocked"
                    ),
                }
                next
            } else {
                state.current_key_id.clone()
            }
        }?;

        if !self.credentials.set_default(&next_id).await {
            tracing::warn!(provider = %provider, key_id = %next_id, "Failed to mark key as default");
        }
        self.credentials.get_key(&next_id).await
    }

    /// Rediscovers the provider's keys and clears exhaustion
    pub async fn reset(&self, provider: &str) -> usize {
        let count = self.register(provider).await;
        tracing::info!(provider = %provider, keys = count, "Provider key pool reset");
        count
    }

    pub fn remove_key(&self, provider: &str, key_id: &str) {
        if let Some(mut state) = self.states.get_mut(provider) {
            state.remove(key_id);
        }
    }

    pub fn remove_provider(&self, provider: &str) {
        self.states.remove(provider);
    }

    pub fn state(&self, provider: &str) -> Option<KeyRotationState> {
        self.states.get(provider).map(|s| s.clone())
    }

    pub fn is_blocked(&self, provider: &str) -> bool {
        self.states
            .get(provider)
            .map_or(true, |s| s.is_rotation_blocked)
    }
}
