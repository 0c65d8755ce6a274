// # Preferences Store Trait
//
// Defines the interface for the document store holding per-user
// notification preferences.
//
// ## Implementations
//
// - In-memory: `MemoryPreferencesStore`
// - File-based: `FilePreferencesStore` (JSON with atomic writes)
// - Future: document-database adapters
//
// ## Usage
//
// ```rust,ignore
// use prefsync_core::{PreferencesRecord, PreferencesStore};
//
// if store.create_if_absent("user@example.com", &PreferencesRecord::defaults()).await? {
//     // defaults written, a change event will follow
// }
// ```

use crate::preferences::PreferencesRecord;
use async_trait::async_trait;

/// Trait for preference store implementations
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Trust Level: Trusted (Core Component)
///
/// - ✅ Perform I/O for persistent storage
/// - ✅ Implement locking for thread safety
/// - ❌ Call the mailing-list service (owned by `SyncEngine`)
/// - ❌ Decide when a sync happens (owned by the external trigger layer)
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    /// Get a user's preferences record
    ///
    /// # Returns
    ///
    /// - `Ok(Some(record))`: The stored record (possibly missing keys)
    /// - `Ok(None)`: No record for this user
    /// - `Err(Error)`: Storage error
    async fn get(&self, user_id: &str) -> Result<Option<PreferencesRecord>, crate::Error>;

    /// Merge the keys present in `partial` into the user's record
    ///
    /// Creates the record if it does not exist. Keys absent from `partial`
    /// are left untouched.
    async fn set_merge(&self, user_id: &str, partial: &PreferencesRecord) -> Result<(), crate::Error>;

    /// Write `record` only if the user has no record yet
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: Record created
    /// - `Ok(false)`: A record already existed and was left untouched
    async fn create_if_absent(
        &self,
        user_id: &str,
        record: &PreferencesRecord,
    ) -> Result<bool, crate::Error>;

    /// Delete a user's preferences record
    ///
    /// Called when the parent user is destroyed; stores that track the user
    /// set drop the user as well.
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: Record deleted
    /// - `Ok(false)`: Nothing to delete (not an error)
    async fn delete(&self, user_id: &str) -> Result<bool, crate::Error>;

    /// List every known user, with or without preferences
    async fn list_users(&self) -> Result<Vec<String>, crate::Error>;

    /// Create a batch of records as one unit
    ///
    /// Each entry is written only if its user has no record at commit time;
    /// existing records are left untouched. Either every eligible record in
    /// the batch is written or none is.
    ///
    /// # Returns
    ///
    /// The number of records actually created.
    async fn commit_batch(&self, records: &[(String, PreferencesRecord)]) -> Result<usize, crate::Error>;

    /// List users that have no preferences record
    async fn list_users_missing_preferences(&self) -> Result<Vec<String>, crate::Error> {
        let mut missing = Vec::new();
        for user_id in self.list_users().await? {
            if self.get(&user_id).await?.is_none() {
                missing.push(user_id);
            }
        }
        Ok(missing)
    }

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error> {
        Ok(())
    }
}
