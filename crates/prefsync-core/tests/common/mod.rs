//! Test doubles and common utilities for engine contract tests
//!
//! This module provides minimal test doubles that record what the engine
//! asks of its collaborators without implementing real functionality.

#![allow(dead_code)]

use prefsync_core::error::{Error, Result};
use prefsync_core::traits::{ListTarget, MailingListClient, MemberUpsert, PreferencesStore};
use prefsync_core::{
    MailingListConfig, MemoryPreferencesStore, PreferencesRecord, SubscriptionStatus, SyncConfig,
    TagTransition,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A call received by [`RecordingClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    Upsert {
        address: String,
        status: SubscriptionStatus,
        tags: Vec<String>,
    },
    Tags {
        address: String,
        transitions: Vec<TagTransition>,
    },
}

/// A mailing-list client that records every call and can fail on demand
///
/// Scripted failures are consumed one per call: `Some(code)` fails with
/// that HTTP status, `None` fails with a transport error.
#[derive(Clone, Default)]
pub struct RecordingClient {
    calls: Arc<Mutex<Vec<ClientCall>>>,
    upsert_failures: Arc<Mutex<VecDeque<Option<u16>>>>,
    tag_failures: Arc<Mutex<VecDeque<Option<u16>>>>,
    upsert_call_count: Arc<AtomicUsize>,
    tag_call_count: Arc<AtomicUsize>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next upsert calls with these statuses
    pub fn fail_upserts(&self, statuses: impl IntoIterator<Item = Option<u16>>) {
        self.upsert_failures.lock().unwrap().extend(statuses);
    }

    /// Fail the next tag-update calls with these statuses
    pub fn fail_tag_updates(&self, statuses: impl IntoIterator<Item = Option<u16>>) {
        self.tag_failures.lock().unwrap().extend(statuses);
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn upsert_call_count(&self) -> usize {
        self.upsert_call_count.load(Ordering::SeqCst)
    }

    pub fn tag_call_count(&self) -> usize {
        self.tag_call_count.load(Ordering::SeqCst)
    }

    fn next_failure(queue: &Mutex<VecDeque<Option<u16>>>) -> Option<Error> {
        queue.lock().unwrap().pop_front().map(|status| match status {
            Some(code) => Error::service("recording", code, "scripted failure"),
            None => Error::transport("recording", "connection reset"),
        })
    }
}

#[async_trait::async_trait]
impl MailingListClient for RecordingClient {
    async fn upsert_member(
        &self,
        _target: &ListTarget,
        address: &str,
        member: &MemberUpsert,
    ) -> Result<()> {
        self.upsert_call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Self::next_failure(&self.upsert_failures) {
            return Err(err);
        }
        self.calls.lock().unwrap().push(ClientCall::Upsert {
            address: address.to_string(),
            status: member.status,
            tags: member.tags.clone(),
        });
        Ok(())
    }

    async fn update_member_tags(
        &self,
        _target: &ListTarget,
        address: &str,
        transitions: &[TagTransition],
    ) -> Result<()> {
        self.tag_call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Self::next_failure(&self.tag_failures) {
            return Err(err);
        }
        self.calls.lock().unwrap().push(ClientCall::Tags {
            address: address.to_string(),
            transitions: transitions.to_vec(),
        });
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "recording"
    }
}

/// A preference store that records batch commits and can fail on demand
#[derive(Clone, Default)]
pub struct RecordingStore {
    inner: MemoryPreferencesStore,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
    unreadable_users: Arc<Mutex<HashSet<String>>>,
    fail_merges: Arc<Mutex<bool>>,
    fail_deletes: Arc<Mutex<bool>>,
    deletes_not_found: Arc<Mutex<bool>>,
    writes_on_read: Arc<Mutex<Vec<(String, String, PreferencesRecord)>>>,
    merge_call_count: Arc<AtomicUsize>,
    delete_call_count: Arc<AtomicUsize>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `total` users named `user-NNNN@example.com`, giving the
    /// first `with_preferences` of them a default record
    pub async fn with_users(total: usize, with_preferences: usize) -> Self {
        let store = Self::new();
        for i in 0..total {
            let user_id = format!("user-{:04}@example.com", i);
            store.inner.add_user(user_id.clone()).await;
            if i < with_preferences {
                store
                    .inner
                    .create_if_absent(&user_id, &PreferencesRecord::defaults())
                    .await
                    .unwrap();
            }
        }
        store
    }

    pub fn memory(&self) -> &MemoryPreferencesStore {
        &self.inner
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn make_unreadable(&self, user_id: &str) {
        self.unreadable_users.lock().unwrap().insert(user_id.to_string());
    }

    pub fn fail_merges(&self) {
        *self.fail_merges.lock().unwrap() = true;
    }

    pub fn fail_deletes(&self) {
        *self.fail_deletes.lock().unwrap() = true;
    }

    /// Make `delete` report the record as not found
    pub fn deletes_not_found(&self) {
        *self.deletes_not_found.lock().unwrap() = true;
    }

    /// When `trigger` is read, create `record` for `target` first, as a
    /// concurrent writer would
    pub fn write_on_read(&self, trigger: &str, target: &str, record: PreferencesRecord) {
        self.writes_on_read
            .lock()
            .unwrap()
            .push((trigger.to_string(), target.to_string(), record));
    }

    pub fn merge_call_count(&self) -> usize {
        self.merge_call_count.load(Ordering::SeqCst)
    }

    pub fn delete_call_count(&self) -> usize {
        self.delete_call_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PreferencesStore for RecordingStore {
    async fn get(&self, user_id: &str) -> Result<Option<PreferencesRecord>> {
        if self.unreadable_users.lock().unwrap().contains(user_id) {
            return Err(Error::store(format!("read of {} timed out", user_id)));
        }
        let pending: Vec<_> = {
            let mut writes = self.writes_on_read.lock().unwrap();
            let (due, rest): (Vec<_>, Vec<_>) = writes
                .drain(..)
                .partition(|(trigger, _, _)| trigger.as_str() == user_id);
            *writes = rest;
            due
        };
        for (_, target, record) in pending {
            self.inner.create_if_absent(&target, &record).await?;
        }
        self.inner.get(user_id).await
    }

    async fn set_merge(&self, user_id: &str, partial: &PreferencesRecord) -> Result<()> {
        self.merge_call_count.fetch_add(1, Ordering::SeqCst);
        if *self.fail_merges.lock().unwrap() {
            return Err(Error::store("write rejected"));
        }
        self.inner.set_merge(user_id, partial).await
    }

    async fn create_if_absent(&self, user_id: &str, record: &PreferencesRecord) -> Result<bool> {
        self.inner.create_if_absent(user_id, record).await
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        self.delete_call_count.fetch_add(1, Ordering::SeqCst);
        if *self.fail_deletes.lock().unwrap() {
            return Err(Error::store("delete rejected"));
        }
        if *self.deletes_not_found.lock().unwrap() {
            return Err(Error::not_found(user_id));
        }
        self.inner.delete(user_id).await
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        self.inner.list_users().await
    }

    async fn commit_batch(&self, records: &[(String, PreferencesRecord)]) -> Result<usize> {
        self.batch_sizes.lock().unwrap().push(records.len());
        self.inner.commit_batch(records).await
    }
}

/// A configuration with complete mailing-list settings
pub fn configured() -> SyncConfig {
    let mut config = SyncConfig::new();
    config.mailing_list = MailingListConfig::new("0123456789abcdef-us1", "us1", "list-1");
    config
}

/// Engine wired to the given doubles
pub fn engine_with(
    client: &RecordingClient,
    store: &RecordingStore,
    config: SyncConfig,
) -> (
    prefsync_core::SyncEngine,
    tokio::sync::mpsc::Receiver<prefsync_core::SyncEvent>,
) {
    prefsync_core::SyncEngine::new(Arc::new(client.clone()), Arc::new(store.clone()), config)
        .expect("valid config")
}

/// Drain every event currently buffered
pub fn drain_events(
    rx: &mut tokio::sync::mpsc::Receiver<prefsync_core::SyncEvent>,
) -> Vec<prefsync_core::SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
