//! Cached target policy built from the admin allow/deny lists.
//!
//! Admission reads the current policy without touching storage; the cache
//! is swapped wholesale on refresh so a reader never sees a half-updated
//! list.

use std::sync::{Arc, RwLock};

use stormforge_core::sync::{read, write};
use stormforge_core::targets::TargetPolicy;
use stormforge_db::{StoreError, TargetListStore};

pub struct PolicyCache {
    current: RwLock<Arc<TargetPolicy>>,
    store: Arc<dyn TargetListStore>,
}

/// Result of a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyReload {
    pub allow_entries: usize,
    pub deny_entries: usize,
    pub changed: bool,
}

impl PolicyCache {
    /// Starts with an empty policy, which admits nothing until the first
    /// refresh.
    pub fn new(store: Arc<dyn TargetListStore>) -> Self {
        Self {
            current: RwLock::new(Arc::new(TargetPolicy::new(Vec::new(), Vec::new()))),
            store,
        }
    }

    pub fn current(&self) -> Arc<TargetPolicy> {
        Arc::clone(&read(&self.current))
    }

    pub fn store(&self) -> &Arc<dyn TargetListStore> {
        &self.store
    }

    /// Reload both lists from the store and swap the cached policy.
    pub async fn refresh(&self) -> Result<PolicyReload, StoreError> {
        let allow: Vec<_> = self
            .store
            .list_allow_entries()
            .await?
            .into_iter()
            .map(|entry| entry.cidr)
            .collect();
        let deny: Vec<_> = self
            .store
            .list_deny_entries()
            .await?
            .into_iter()
            .map(|entry| entry.cidr)
            .collect();

        let policy = TargetPolicy::new(allow, deny);
        let mut current = write(&self.current);
        let changed = current.allow_entries() != policy.allow_entries()
            || current.deny_entries() != policy.deny_entries();
        let reload = PolicyReload {
            allow_entries: policy.allow_entries().len(),
            deny_entries: policy.deny_entries().len(),
            changed,
        };
        *current = Arc::new(policy);
        Ok(reload)
    }
}

#[cfg(test)]
mod tests {
    use stormforge_core::targets::{ListKind, TargetVerdict};
    use stormforge_db::models::target::NewTargetEntry;
    use stormforge_db::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn refresh_picks_up_new_entries() {
        let store = Arc::new(MemoryStore::new());
        let cache = PolicyCache::new(store.clone());
        assert!(!cache.current().validate("10.0.0.1").is_allowed());

        store
            .add_entry(NewTargetEntry {
                kind: ListKind::Allow,
                cidr: "10.0.0.0/8".parse().unwrap(),
                description: None,
                created_by: Some(1),
            })
            .await
            .unwrap();

        let reload = cache.refresh().await.unwrap();
        assert!(reload.changed);
        assert_eq!(reload.allow_entries, 1);
        assert_eq!(cache.current().validate("10.0.0.1"), TargetVerdict::Allowed);

        let again = cache.refresh().await.unwrap();
        assert!(!again.changed);
    }
}
