// # Memory Preferences Store
//
// In-memory implementation of PreferencesStore.
//
// ## Purpose
//
// Provides a simple, fast store that doesn't persist across restarts.
// Useful for testing and for deployments where the authoritative
// preferences live elsewhere and are replayed through change events.
//
// ## Crash Behavior
//
// - All state is lost on restart/crash
// - The next backfill recreates defaults for every registered user

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::preferences::PreferencesRecord;
use crate::traits::preferences_store::PreferencesStore;

/// In-memory preferences store
///
/// Users and preference records are tracked separately, so a user can be
/// known to the store without having preferences yet.
///
/// # Example
///
/// ```rust,no_run
/// use prefsync_core::state::MemoryPreferencesStore;
/// use prefsync_core::traits::PreferencesStore;
/// use prefsync_core::PreferencesRecord;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryPreferencesStore::new();
///     store.add_user("user@example.com").await;
///
///     store.create_if_absent("user@example.com", &PreferencesRecord::defaults()).await?;
///     assert!(store.get("user@example.com").await?.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferencesStore {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: BTreeSet<String>,
    records: HashMap<String, PreferencesRecord>,
}

impl MemoryPreferencesStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user without preferences
    pub async fn add_user(&self, user_id: impl Into<String>) {
        self.inner.write().await.users.insert(user_id.into());
    }

    /// Number of stored preference records
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Whether no preference record is stored
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

#[async_trait]
impl PreferencesStore for MemoryPreferencesStore {
    async fn get(&self, user_id: &str) -> Result<Option<PreferencesRecord>, Error> {
        Ok(self.inner.read().await.records.get(user_id).cloned())
    }

    async fn set_merge(&self, user_id: &str, partial: &PreferencesRecord) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.users.insert(user_id.to_string());
        guard
            .records
            .entry(user_id.to_string())
            .or_default()
            .merge(partial);
        Ok(())
    }

    async fn create_if_absent(&self, user_id: &str, record: &PreferencesRecord) -> Result<bool, Error> {
        let mut guard = self.inner.write().await;
        guard.users.insert(user_id.to_string());
        if guard.records.contains_key(user_id) {
            return Ok(false);
        }
        guard.records.insert(user_id.to_string(), record.clone());
        Ok(true)
    }

    async fn delete(&self, user_id: &str) -> Result<bool, Error> {
        let mut guard = self.inner.write().await;
        guard.users.remove(user_id);
        Ok(guard.records.remove(user_id).is_some())
    }

    async fn list_users(&self) -> Result<Vec<String>, Error> {
        Ok(self.inner.read().await.users.iter().cloned().collect())
    }

    async fn commit_batch(&self, records: &[(String, PreferencesRecord)]) -> Result<usize, Error> {
        let mut guard = self.inner.write().await;
        let mut created = 0;
        for (user_id, record) in records {
            guard.users.insert(user_id.clone());
            if !guard.records.contains_key(user_id) {
                guard.records.insert(user_id.clone(), record.clone());
                created += 1;
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::PreferenceKey;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryPreferencesStore::new();

        // Initially empty
        assert!(store.is_empty().await);
        assert_eq!(store.get("a@example.com").await.unwrap(), None);

        // Create, then refuse to overwrite
        assert!(store.create_if_absent("a@example.com", &PreferencesRecord::defaults()).await.unwrap());
        assert!(!store.create_if_absent("a@example.com", &PreferencesRecord::all(false)).await.unwrap());
        assert_eq!(store.get("a@example.com").await.unwrap(), Some(PreferencesRecord::defaults()));

        // Delete is idempotent
        assert!(store.delete("a@example.com").await.unwrap());
        assert!(!store.delete("a@example.com").await.unwrap());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_memory_store_merge() {
        let store = MemoryPreferencesStore::new();
        let partial = PreferencesRecord::new().with(PreferenceKey::MarketingEmails, false);
        store.set_merge("a@example.com", &partial).await.unwrap();

        let added = PreferencesRecord::new().with(PreferenceKey::ProductUpdates, true);
        store.set_merge("a@example.com", &added).await.unwrap();

        let record = store.get("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.get(PreferenceKey::MarketingEmails), Some(false));
        assert_eq!(record.get(PreferenceKey::ProductUpdates), Some(true));
        assert_eq!(record.get(PreferenceKey::TodoNotifications), None);
    }

    #[tokio::test]
    async fn test_memory_store_missing_preferences() {
        let store = MemoryPreferencesStore::new();
        store.add_user("a@example.com").await;
        store.add_user("b@example.com").await;
        store.create_if_absent("b@example.com", &PreferencesRecord::defaults()).await.unwrap();

        assert_eq!(store.list_users().await.unwrap().len(), 2);
        assert_eq!(
            store.list_users_missing_preferences().await.unwrap(),
            vec!["a@example.com".to_string()]
        );

        store
            .commit_batch(&[("a@example.com".to_string(), PreferencesRecord::defaults())])
            .await
            .unwrap();
        assert!(store.list_users_missing_preferences().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_commit_batch_never_overwrites() {
        let store = MemoryPreferencesStore::new();
        let opted_out = PreferencesRecord::all(false);
        store.create_if_absent("a@example.com", &opted_out).await.unwrap();

        let created = store
            .commit_batch(&[
                ("a@example.com".to_string(), PreferencesRecord::defaults()),
                ("b@example.com".to_string(), PreferencesRecord::defaults()),
            ])
            .await
            .unwrap();

        assert_eq!(created, 1);
        assert_eq!(store.get("a@example.com").await.unwrap(), Some(opted_out));
        assert_eq!(
            store.get("b@example.com").await.unwrap(),
            Some(PreferencesRecord::defaults())
        );
    }
}
