//! Notification preference data model
//!
//! A [`PreferencesRecord`] maps each [`PreferenceKey`] to a boolean opt-in.
//! The key set is closed: adding a preference means adding an enum variant,
//! and every table below is an exhaustive `match`.
//!
//! Stored documents are loose JSON objects. Parsing ignores unknown keys and
//! non-boolean values, and keeps absent keys absent so the engine can tell
//! which defaults still need to be written back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A notification preference the user can toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreferenceKey {
    /// Marketing emails
    MarketingEmails,
    /// Product update announcements
    ProductUpdates,
    /// Todo reminders
    TodoNotifications,
}

impl PreferenceKey {
    /// Every preference key, in canonical order
    pub const ALL: [PreferenceKey; 3] = [
        PreferenceKey::MarketingEmails,
        PreferenceKey::ProductUpdates,
        PreferenceKey::TodoNotifications,
    ];

    /// Field name used in stored preference documents
    pub fn field_name(self) -> &'static str {
        match self {
            PreferenceKey::MarketingEmails => "marketingEmailsEnabled",
            PreferenceKey::ProductUpdates => "productUpdatesEnabled",
            PreferenceKey::TodoNotifications => "todoNotificationsEnabled",
        }
    }

    /// Tag name on the mailing-list service
    pub fn tag_name(self) -> &'static str {
        match self {
            PreferenceKey::MarketingEmails => "Marketing Emails",
            PreferenceKey::ProductUpdates => "Product Updates",
            PreferenceKey::TodoNotifications => "Todo Notifications",
        }
    }

    /// Value used when the key is missing from a stored document
    pub fn default_value(self) -> bool {
        true
    }

    /// Look up a key by its document field name
    pub fn from_field_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.field_name() == name)
    }
}

impl std::fmt::Display for PreferenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Per-user notification preferences
///
/// Keys that are absent read as their default (`true`) through
/// [`is_enabled`](Self::is_enabled).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct PreferencesRecord {
    values: BTreeMap<PreferenceKey, bool>,
}

impl PreferencesRecord {
    /// An empty record (every key absent)
    pub fn new() -> Self {
        Self::default()
    }

    /// The record created for new users: every key set to its default
    pub fn defaults() -> Self {
        let mut record = Self::new();
        for key in PreferenceKey::ALL {
            record.set(key, key.default_value());
        }
        record
    }

    /// A complete record with every key set to `value`
    pub fn all(value: bool) -> Self {
        let mut record = Self::new();
        for key in PreferenceKey::ALL {
            record.set(key, value);
        }
        record
    }

    /// Parse a stored document
    ///
    /// Non-object documents parse as an empty record.
    pub fn from_document(document: &Value) -> Self {
        match document {
            Value::Object(map) => Self::from(map.clone()),
            _ => Self::new(),
        }
    }

    /// Set a key, returning `self` for chaining
    pub fn with(mut self, key: PreferenceKey, value: bool) -> Self {
        self.set(key, value);
        self
    }

    /// Set a key
    pub fn set(&mut self, key: PreferenceKey, value: bool) {
        self.values.insert(key, value);
    }

    /// Stored value for a key, `None` if absent
    pub fn get(&self, key: PreferenceKey) -> Option<bool> {
        self.values.get(&key).copied()
    }

    /// Effective value for a key, falling back to the default when absent
    pub fn is_enabled(&self, key: PreferenceKey) -> bool {
        self.get(key).unwrap_or_else(|| key.default_value())
    }

    /// Keys with no stored value
    pub fn missing_keys(&self) -> Vec<PreferenceKey> {
        PreferenceKey::ALL
            .into_iter()
            .filter(|key| !self.values.contains_key(key))
            .collect()
    }

    /// Whether every key has a stored value
    pub fn is_complete(&self) -> bool {
        self.values.len() == PreferenceKey::ALL.len()
    }

    /// Fill absent keys with their defaults
    ///
    /// Returns the complete record and the partial record holding only the
    /// keys that were added (empty when nothing was missing).
    pub fn with_defaults(&self) -> (Self, Self) {
        let mut complete = self.clone();
        let mut added = Self::new();
        for key in self.missing_keys() {
            complete.set(key, key.default_value());
            added.set(key, key.default_value());
        }
        (complete, added)
    }

    /// Overlay the keys present in `partial` onto this record
    pub fn merge(&mut self, partial: &PreferencesRecord) {
        for (key, value) in &partial.values {
            self.values.insert(*key, *value);
        }
    }

    /// Iterate over stored `(key, value)` pairs in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (PreferenceKey, bool)> + '_ {
        self.values.iter().map(|(key, value)| (*key, *value))
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no key is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Map<String, Value>> for PreferencesRecord {
    fn from(map: Map<String, Value>) -> Self {
        let mut record = Self::new();
        for (name, value) in map {
            let (Some(key), Some(value)) = (PreferenceKey::from_field_name(&name), value.as_bool())
            else {
                continue;
            };
            record.set(key, value);
        }
        record
    }
}

impl From<PreferencesRecord> for Map<String, Value> {
    fn from(record: PreferencesRecord) -> Self {
        record
            .values
            .into_iter()
            .map(|(key, value)| (key.field_name().to_string(), Value::Bool(value)))
            .collect()
    }
}
