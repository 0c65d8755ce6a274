//! Sync orchestration
//!
//! The SyncEngine is responsible for:
//! - Projecting a user's preferences onto subscription status and tags
//! - Upserting the member and applying tag transitions via MailingListClient
//! - Wrapping every external call in the retry policy
//! - Creating, completing and deleting preference records via PreferencesStore
//! - Backfilling default records for users that have none
//!
//! ## Architecture
//!
//! ```text
//!   change events (created / written / deleted)
//!                     │
//!                     ▼
//!            ┌──────────────────┐
//!            │    SyncEngine    │
//!            └──────────────────┘
//!                     │
//!     ┌───────────────┼────────────────┬─────────────────┐
//!     │               │                │                 │
//!     ▼               ▼                ▼                 ▼
//! ┌─────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────┐
//! │ project │  │ Preferences  │  │ MailingList  │  │  Events  │
//! │ + diff  │  │ Store        │  │ Client       │  │ (notify) │
//! └─────────┘  └──────────────┘  └──────────────┘  └──────────┘
//! ```
//!
//! ## Sync Flow
//!
//! 1. A deleted record syncs as all-`false`
//! 2. Resolve the list target; abort with no external call if incomplete
//! 3. Project the current record
//! 4. Upsert the member (with retry)
//! 5. Diff previous against current
//! 6. Apply the tag transitions (with retry), only if the upsert succeeded
//!
//! Every path ends in a [`SyncOutcome`]; nothing is returned as an error
//! because the callers are fire-and-forget event handlers.

use crate::config::{MailingListConfig, SyncConfig};
use crate::error::{Error, Result};
use crate::preferences::PreferencesRecord;
use crate::projection::{SubscriptionStatus, project};
use crate::reconcile::{TagTransition, diff};
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::traits::{MailingListClient, MemberUpsert, PreferencesStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Events emitted by the SyncEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Sync of one user started
    SyncStarted {
        user_id: String,
    },

    /// Upsert and tag update both succeeded
    SyncSucceeded {
        user_id: String,
        status: SubscriptionStatus,
        transitions: usize,
    },

    /// A step failed after retries or with a fatal error
    SyncFailed {
        user_id: String,
        stage: SyncStage,
        error: String,
    },

    /// Sync aborted before any external call
    ConfigurationMissing {
        user_id: String,
        message: String,
    },

    /// Default values were written for a user
    DefaultsCreated {
        user_id: String,
        keys_added: usize,
    },

    /// A user's record was removed (or was already absent)
    PreferencesDeleted {
        user_id: String,
        existed: bool,
    },

    /// Backfill finished
    BackfillCompleted {
        users_scanned: usize,
        records_created: usize,
    },
}

/// The new state handed to [`SyncEngine::sync_user`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferencesChange {
    /// The record was created or changed
    Updated(PreferencesRecord),
    /// The record (or its user) was deleted
    Deleted,
}

/// The external call a sync failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Member upsert
    Upsert,
    /// Incremental tag update
    TagUpdate,
}

impl SyncStage {
    /// Label used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStage::Upsert => "upsert_member",
            SyncStage::TagUpdate => "update_member_tags",
        }
    }
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one sync
#[derive(Debug)]
pub enum SyncOutcome {
    /// The service now reflects the projection
    Synced {
        status: SubscriptionStatus,
        active_tags: Vec<String>,
        transitions: Vec<TagTransition>,
    },

    /// An external call failed; later steps were skipped
    Failed {
        stage: SyncStage,
        error: Error,
    },

    /// Mailing-list configuration is incomplete; nothing was sent
    ConfigurationError(String),
}

impl SyncOutcome {
    /// Whether the sync completed
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. })
    }
}

/// Summary of a backfill run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Users listed by the store
    pub users_scanned: usize,
    /// Default records written
    pub records_created: usize,
    /// Batches committed (including the final partial one)
    pub batches_committed: usize,
}

impl std::fmt::Display for BackfillReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Backfill complete: scanned {} users, created {} preference records in {} batches",
            self.users_scanned, self.records_created, self.batches_committed
        )
    }
}

/// Core sync engine
///
/// ## Lifecycle
///
/// 1. Create with [`SyncEngine::new()`]
/// 2. Share behind an `Arc` and call the handlers from event tasks
/// 3. Consume [`SyncEvent`]s from the returned receiver for monitoring
///
/// ## Concurrency
///
/// Syncs for different users run concurrently. With
/// `engine.serialize_per_user` enabled (the default), handlers for the same
/// user queue behind a per-user lock so their tag transitions apply in
/// arrival order.
pub struct SyncEngine {
    /// Mailing-list client for external calls
    client: Arc<dyn MailingListClient>,

    /// Preference store
    store: Arc<dyn PreferencesStore>,

    /// Credentials and list, resolved per sync
    mailing_list: MailingListConfig,

    /// Policy for every external call
    retry: RetryPolicy,

    /// Records per backfill commit
    batch_size: usize,

    /// Per-user serialization, if enabled
    user_locks: Option<UserLocks>,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncEngine {
    /// Create a new sync engine
    ///
    /// # Parameters
    ///
    /// - `client`: Mailing-list client implementation
    /// - `store`: Preference store implementation
    /// - `config`: Sync configuration
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields sync events
    pub fn new(
        client: Arc<dyn MailingListClient>,
        store: Arc<dyn PreferencesStore>,
        config: SyncConfig,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let engine = Self {
            client,
            store,
            retry: config.retry.policy(),
            batch_size: config.backfill.batch_size,
            mailing_list: config.mailing_list,
            user_locks: config.engine.serialize_per_user.then(UserLocks::default),
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Sync one user to the mailing-list service
    ///
    /// `previous` is the record before the change, if any; it only affects
    /// which tag transitions are sent.
    pub async fn sync_user(
        &self,
        user_id: &str,
        change: PreferencesChange,
        previous: Option<&PreferencesRecord>,
    ) -> SyncOutcome {
        let _guard = self.lock_user(user_id).await;
        self.sync_user_unlocked(user_id, change, previous).await
    }

    /// Handle a newly created user
    ///
    /// Writes the default record unless one already exists. The write itself
    /// produces the change event that leads to the first sync.
    ///
    /// # Returns
    ///
    /// `true` if defaults were written. Store failures are logged and
    /// reported as `false`.
    pub async fn on_user_created(&self, user_id: &str) -> bool {
        let _guard = self.lock_user(user_id).await;

        let defaults = PreferencesRecord::defaults();
        match self.store.create_if_absent(user_id, &defaults).await {
            Ok(true) => {
                info!("Created default preferences for {}", user_id);
                self.emit_event(SyncEvent::DefaultsCreated {
                    user_id: user_id.to_string(),
                    keys_added: defaults.len(),
                });
                true
            }
            Ok(false) => {
                debug!("Preferences already exist for {}, leaving them untouched", user_id);
                false
            }
            Err(e) => {
                error!("Failed to create default preferences for {}: {}", user_id, e);
                false
            }
        }
    }

    /// Handle a write to a user's preferences document
    ///
    /// `before` and `after` are the raw document snapshots. A missing
    /// `after` means the document was deleted. Keys missing from `after` are
    /// written back with their defaults; if that write fails the sync still
    /// proceeds with the completed record.
    pub async fn on_preferences_written(
        &self,
        user_id: &str,
        before: Option<Value>,
        after: Option<Value>,
    ) -> SyncOutcome {
        let _guard = self.lock_user(user_id).await;

        let previous = before.as_ref().map(PreferencesRecord::from_document);

        let Some(after) = after else {
            info!("Preferences for {} deleted, unsubscribing", user_id);
            return self
                .sync_user_unlocked(user_id, PreferencesChange::Deleted, previous.as_ref())
                .await;
        };

        let (current, added) = PreferencesRecord::from_document(&after).with_defaults();
        if !added.is_empty() {
            match self.store.set_merge(user_id, &added).await {
                Ok(()) => {
                    info!("Filled {} missing preference(s) for {}", added.len(), user_id);
                    self.emit_event(SyncEvent::DefaultsCreated {
                        user_id: user_id.to_string(),
                        keys_added: added.len(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Failed to store missing preference defaults for {}: {}. Continuing sync.",
                        user_id, e
                    );
                }
            }
        }

        self.sync_user_unlocked(user_id, PreferencesChange::Updated(current), previous.as_ref())
            .await
    }

    /// Handle a deleted user
    ///
    /// Unsubscribes the member with every tag inactive, then removes the
    /// preferences record. The record is removed even if the sync failed;
    /// an already-absent record is not an error.
    pub async fn on_user_deleted(&self, user_id: &str) -> SyncOutcome {
        let _guard = self.lock_user(user_id).await;

        let outcome = self
            .sync_user_unlocked(user_id, PreferencesChange::Deleted, None)
            .await;

        match self.store.delete(user_id).await {
            Ok(existed) => {
                if existed {
                    info!("Deleted preferences for {}", user_id);
                } else {
                    debug!("No preferences to delete for {}", user_id);
                }
                self.emit_event(SyncEvent::PreferencesDeleted {
                    user_id: user_id.to_string(),
                    existed,
                });
            }
            Err(Error::NotFound(_)) => {
                debug!("No preferences to delete for {}", user_id);
                self.emit_event(SyncEvent::PreferencesDeleted {
                    user_id: user_id.to_string(),
                    existed: false,
                });
            }
            Err(e) => {
                error!("Failed to delete preferences for {}: {}", user_id, e);
            }
        }

        outcome
    }

    /// Create default records for every user that has none
    ///
    /// Records are committed in batches of `backfill.batch_size`, one batch
    /// at a time, with a final partial batch at the end. A failed read for
    /// one user is logged and skipped. No external calls are made: the
    /// created records reach the service through the normal change path.
    ///
    /// # Returns
    ///
    /// - `Ok(BackfillReport)`: Every batch was committed
    /// - `Err(Error)`: Listing users or committing a batch failed
    pub async fn run_backfill(&self) -> Result<BackfillReport> {
        let users = self.store.list_users().await?;
        info!("Backfill started: {} users to scan", users.len());

        let mut report = BackfillReport {
            users_scanned: users.len(),
            ..BackfillReport::default()
        };
        let mut batch: Vec<(String, PreferencesRecord)> = Vec::with_capacity(self.batch_size);

        for user_id in users {
            match self.store.get(&user_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    debug!("Queueing default preferences for {}", user_id);
                    batch.push((user_id, PreferencesRecord::defaults()));
                }
                Err(e) => {
                    warn!("Failed to read preferences for {}: {}. Skipping.", user_id, e);
                    continue;
                }
            }

            if batch.len() >= self.batch_size {
                self.commit_backfill_batch(&mut batch, &mut report).await?;
            }
        }

        if !batch.is_empty() {
            self.commit_backfill_batch(&mut batch, &mut report).await?;
        }

        info!("{}", report);
        self.emit_event(SyncEvent::BackfillCompleted {
            users_scanned: report.users_scanned,
            records_created: report.records_created,
        });

        Ok(report)
    }

    async fn commit_backfill_batch(
        &self,
        batch: &mut Vec<(String, PreferencesRecord)>,
        report: &mut BackfillReport,
    ) -> Result<()> {
        let created = self.store.commit_batch(batch).await?;
        report.batches_committed += 1;
        report.records_created += created;
        if created < batch.len() {
            info!(
                "{} user(s) gained preferences during the scan; their records were left untouched",
                batch.len() - created
            );
        }
        debug!(
            "Committed backfill batch {} ({} of {} records created)",
            report.batches_committed,
            created,
            batch.len()
        );
        batch.clear();
        Ok(())
    }

    async fn sync_user_unlocked(
        &self,
        user_id: &str,
        change: PreferencesChange,
        previous: Option<&PreferencesRecord>,
    ) -> SyncOutcome {
        let current = match change {
            PreferencesChange::Updated(record) => record,
            PreferencesChange::Deleted => PreferencesRecord::all(false),
        };

        let target = match self.mailing_list.resolve() {
            Ok(target) => target,
            Err(e) => {
                let message = e.to_string();
                error!("Cannot sync {}: {}", user_id, message);
                self.emit_event(SyncEvent::ConfigurationMissing {
                    user_id: user_id.to_string(),
                    message: message.clone(),
                });
                return SyncOutcome::ConfigurationError(message);
            }
        };

        self.emit_event(SyncEvent::SyncStarted {
            user_id: user_id.to_string(),
        });

        let projection = project(&current);
        let member = MemberUpsert::from(&projection);
        debug!(
            "Projected {} -> status={}, tags={:?}",
            user_id, projection.status, member.tags
        );

        let client = self.client.as_ref();
        let upsert = execute_with_retry(&self.retry, SyncStage::Upsert.as_str(), user_id, || {
            client.upsert_member(&target, user_id, &member)
        })
        .await;
        if let Err(error) = upsert {
            return self.fail(user_id, SyncStage::Upsert, error);
        }

        let transitions = diff(previous, &current);
        if transitions.is_empty() {
            debug!("No tag transitions for {}", user_id);
        } else {
            let tags = execute_with_retry(&self.retry, SyncStage::TagUpdate.as_str(), user_id, || {
                client.update_member_tags(&target, user_id, &transitions)
            })
            .await;
            if let Err(error) = tags {
                return self.fail(user_id, SyncStage::TagUpdate, error);
            }
        }

        info!(
            "Synced {} via {}: status={}, {} tag transition(s)",
            user_id,
            client.provider_name(),
            projection.status,
            transitions.len()
        );
        self.emit_event(SyncEvent::SyncSucceeded {
            user_id: user_id.to_string(),
            status: projection.status,
            transitions: transitions.len(),
        });

        SyncOutcome::Synced {
            status: projection.status,
            active_tags: member.tags,
            transitions,
        }
    }

    fn fail(&self, user_id: &str, stage: SyncStage, error: Error) -> SyncOutcome {
        error!("Sync failed for {} at {}: {}", user_id, stage, error);
        self.emit_event(SyncEvent::SyncFailed {
            user_id: user_id.to_string(),
            stage,
            error: error.to_string(),
        });
        SyncOutcome::Failed { stage, error }
    }

    async fn lock_user(&self, user_id: &str) -> Option<UserLockGuard<'_>> {
        match &self.user_locks {
            Some(locks) => Some(locks.acquire(user_id).await),
            None => None,
        }
    }

    /// Emit a sync event
    fn emit_event(&self, event: SyncEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event receiver dropped, discarding event");
            }
        }
    }
}

/// Keyed async mutex: one lock per user with a sync in flight
#[derive(Default)]
struct UserLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: &str) -> UserLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(user_id.to_string()).or_default())
        };

        UserLockGuard {
            locks: self,
            user_id: user_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Holds a user's lock; drops the map entry when nobody else is waiting
struct UserLockGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for UserLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserLockGuard")
            .field("user_id", &self.user_id)
            .field("held", &self.guard.is_some())
            .finish()
    }
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}
