// # File Preferences Store
//
// File-based implementation of PreferencesStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good state
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "users": {
//     "user@example.com": {
//       "preferences": {
//         "marketingEmailsEnabled": true,
//         "productUpdatesEnabled": false,
//         "todoNotificationsEnabled": true
//       },
//       "last_updated": "2025-01-09T12:00:00Z"
//     },
//     "new@example.com": {
//       "preferences": null,
//       "last_updated": "2025-01-09T12:00:00Z"
//     }
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::preferences::PreferencesRecord;
use crate::traits::preferences_store::PreferencesStore;

/// State file format version
/// Used for future migration if format changes
const STATE_FILE_VERSION: &str = "1.0";

/// File-based preferences store with crash recovery
///
/// Every mutation is applied to a copy of the in-memory state, written to
/// disk atomically, and only then made visible. A failed write leaves both
/// the file and the in-memory state unchanged, which also makes
/// [`commit_batch`](PreferencesStore::commit_batch) all-or-nothing.
///
/// # Example
///
/// ```rust,no_run
/// use prefsync_core::state::FilePreferencesStore;
/// use prefsync_core::traits::PreferencesStore;
/// use prefsync_core::PreferencesRecord;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FilePreferencesStore::new("/var/lib/prefsync/preferences.json").await?;
///
///     store.create_if_absent("user@example.com", &PreferencesRecord::defaults()).await?;
///     assert!(store.get("user@example.com").await?.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FilePreferencesStore {
    path: PathBuf,
    users: Arc<RwLock<HashMap<String, UserEntry>>>,
}

/// Stored state for one user
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct UserEntry {
    preferences: Option<PreferencesRecord>,
    last_updated: chrono::DateTime<chrono::Utc>,
}

impl UserEntry {
    fn new(preferences: Option<PreferencesRecord>) -> Self {
        Self {
            preferences,
            last_updated: chrono::Utc::now(),
        }
    }
}

/// Serializable state file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StateFileFormat {
    version: String,
    users: HashMap<String, UserEntry>,
}

impl FilePreferencesStore {
    /// Create or load a file preferences store
    ///
    /// This will:
    /// 1. Try to load existing state file
    /// 2. If corruption detected, try to load from backup
    /// 3. If both fail, start with empty state
    /// 4. Create parent directories if needed
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let users = Self::load_state_with_recovery(&path).await?;

        Ok(Self {
            path,
            users: Arc::new(RwLock::new(users)),
        })
    }

    /// Register a user without preferences
    pub async fn add_user(&self, user_id: &str) -> Result<(), Error> {
        self.mutate(|users| {
            users
                .entry(user_id.to_string())
                .or_insert_with(|| UserEntry::new(None));
        })
        .await
    }

    /// Load state from file with automatic recovery
    ///
    /// Recovery strategy:
    /// 1. Try to load main state file
    /// 2. If JSON parse error, try loading backup
    /// 3. If backup also fails, start with empty state
    async fn load_state_with_recovery(path: &Path) -> Result<HashMap<String, UserEntry>, Error> {
        match Self::load_state(path).await {
            Ok(users) => {
                tracing::debug!("Loaded state from file: {} users", users.len());
                Ok(users)
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "State file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with empty state.");
                    return Ok(HashMap::new());
                }

                match Self::load_state(&backup_path).await {
                    Ok(users) => {
                        tracing::info!("Recovered state from backup: {} users", users.len());

                        if let Err(restore_err) = Self::restore_from_backup(path, &backup_path).await {
                            tracing::error!(
                                "Failed to restore state file from backup: {}",
                                restore_err
                            );
                        }

                        Ok(users)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also unreadable: {}. Starting with empty state.",
                            backup_err
                        );
                        Ok(HashMap::new())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Load state from file
    ///
    /// Parse failures are returned as [`Error::Json`] so the caller can
    /// tell corruption apart from I/O errors.
    async fn load_state(path: &Path) -> Result<HashMap<String, UserEntry>, Error> {
        if !path.exists() {
            tracing::debug!("State file does not exist: {}", path.display());
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store(format!("Failed to read state file {}: {}", path.display(), e))
        })?;

        let state_file: StateFileFormat = serde_json::from_str(&content)?;

        if state_file.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. \
                Attempting to load anyway.",
                STATE_FILE_VERSION,
                state_file.version
            );
        }

        Ok(state_file.users)
    }

    /// Apply `change` to a copy of the state, persist it, then publish it
    async fn mutate<R>(&self, change: impl FnOnce(&mut HashMap<String, UserEntry>) -> R) -> Result<R, Error> {
        let mut guard = self.users.write().await;
        let mut next = guard.clone();
        let result = change(&mut next);
        self.write_state(&next).await?;
        *guard = next;
        Ok(result)
    }

    /// Write state to file atomically
    async fn write_state(&self, users: &HashMap<String, UserEntry>) -> Result<(), Error> {
        let state_file = StateFileFormat {
            version: STATE_FILE_VERSION.to_string(),
            users: users.clone(),
        };

        let json = serde_json::to_string_pretty(&state_file)
            .map_err(|e| Error::store(format!("Failed to serialize state: {}", e)))?;

        // Write to temporary file first
        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!("Failed to create temp file {}: {}", temp_path.display(), e))
            })?;

            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!("Failed to write to temp file {}: {}", temp_path.display(), e))
            })?;

            file.flush().await.map_err(|e| {
                Error::store(format!("Failed to flush temp file {}: {}", temp_path.display(), e))
            })?;
        }

        // Create backup of current file (if it exists)
        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        // Atomic rename (temp -> actual)
        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("State written to file: {}", self.path.display());
        Ok(())
    }

    /// Restore state file from backup
    async fn restore_from_backup(path: &Path, backup_path: &Path) -> Result<(), Error> {
        fs::copy(backup_path, path).await.map_err(|e| {
            Error::store(format!(
                "Failed to restore from backup {} to {}: {}",
                backup_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!("Restored state file from backup");
        Ok(())
    }

    /// Get path to temporary file for atomic writes
    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    /// Get path to backup file
    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl PreferencesStore for FilePreferencesStore {
    async fn get(&self, user_id: &str) -> Result<Option<PreferencesRecord>, Error> {
        let guard = self.users.read().await;
        Ok(guard.get(user_id).and_then(|entry| entry.preferences.clone()))
    }

    async fn set_merge(&self, user_id: &str, partial: &PreferencesRecord) -> Result<(), Error> {
        self.mutate(|users| {
            let entry = users
                .entry(user_id.to_string())
                .or_insert_with(|| UserEntry::new(None));
            entry.preferences.get_or_insert_with(PreferencesRecord::new).merge(partial);
            entry.last_updated = chrono::Utc::now();
        })
        .await
    }

    async fn create_if_absent(&self, user_id: &str, record: &PreferencesRecord) -> Result<bool, Error> {
        if self.get(user_id).await?.is_some() {
            return Ok(false);
        }

        self.mutate(|users| {
            let entry = users
                .entry(user_id.to_string())
                .or_insert_with(|| UserEntry::new(None));
            // Re-check under the write lock
            if entry.preferences.is_some() {
                return false;
            }
            entry.preferences = Some(record.clone());
            entry.last_updated = chrono::Utc::now();
            true
        })
        .await
    }

    async fn delete(&self, user_id: &str) -> Result<bool, Error> {
        if !self.users.read().await.contains_key(user_id) {
            return Ok(false);
        }

        self.mutate(|users| {
            users
                .remove(user_id)
                .is_some_and(|entry| entry.preferences.is_some())
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<String>, Error> {
        let guard = self.users.read().await;
        let mut users: Vec<String> = guard.keys().cloned().collect();
        users.sort();
        Ok(users)
    }

    async fn commit_batch(&self, records: &[(String, PreferencesRecord)]) -> Result<usize, Error> {
        if records.is_empty() {
            return Ok(0);
        }

        self.mutate(|users| {
            let mut created = 0;
            for (user_id, record) in records {
                let entry = users
                    .entry(user_id.clone())
                    .or_insert_with(|| UserEntry::new(None));
                if entry.preferences.is_none() {
                    entry.preferences = Some(record.clone());
                    entry.last_updated = chrono::Utc::now();
                    created += 1;
                }
            }
            created
        })
        .await
    }

    async fn flush(&self) -> Result<(), Error> {
        // Every mutation is written through; rewrite to refresh the backup pair
        let guard = self.users.read().await;
        self.write_state(&guard).await
    }
}
