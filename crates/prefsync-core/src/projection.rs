//! Subscription projection
//!
//! Maps a [`PreferencesRecord`] to the representation the mailing-list
//! service expects: one overall status and the set of active tags.

use crate::preferences::{PreferenceKey, PreferencesRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Overall membership status on the mailing list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// At least one preference is enabled
    Subscribed,
    /// Every preference is disabled
    Unsubscribed,
}

impl SubscriptionStatus {
    /// Wire value
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Subscribed => "subscribed",
            SubscriptionStatus::Unsubscribed => "unsubscribed",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived subscription state for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionProjection {
    /// Overall status
    pub status: SubscriptionStatus,
    /// Tags whose preference is enabled
    pub active_tags: BTreeSet<&'static str>,
}

impl SubscriptionProjection {
    /// Active tags as owned strings, in tag-name order
    pub fn active_tag_names(&self) -> Vec<String> {
        self.active_tags.iter().map(|tag| tag.to_string()).collect()
    }
}

/// Project a preferences record onto subscription status and active tags
///
/// Absent keys count as enabled. Pure and total.
pub fn project(preferences: &PreferencesRecord) -> SubscriptionProjection {
    let active_tags: BTreeSet<&'static str> = PreferenceKey::ALL
        .into_iter()
        .filter(|key| preferences.is_enabled(*key))
        .map(PreferenceKey::tag_name)
        .collect();

    let status = if active_tags.is_empty() {
        SubscriptionStatus::Unsubscribed
    } else {
        SubscriptionStatus::Subscribed
    };

    SubscriptionProjection {
        status,
        active_tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every complete record (2^n combinations)
    fn all_records() -> Vec<PreferencesRecord> {
        let n = PreferenceKey::ALL.len();
        (0..1u32 << n)
            .map(|bits| {
                let mut record = PreferencesRecord::new();
                for (i, key) in PreferenceKey::ALL.into_iter().enumerate() {
                    record.set(key, bits & (1 << i) != 0);
                }
                record
            })
            .collect()
    }

    #[test]
    fn test_status_is_logical_or() {
        for record in all_records() {
            let any_enabled = record.iter().any(|(_, value)| value);
            let projection = project(&record);
            assert_eq!(
                projection.status == SubscriptionStatus::Subscribed,
                any_enabled,
                "unexpected status for {:?}",
                record
            );
        }
    }

    #[test]
    fn test_active_tags_are_enabled_keys() {
        for record in all_records() {
            let projection = project(&record);
            for key in PreferenceKey::ALL {
                assert_eq!(
                    projection.active_tags.contains(key.tag_name()),
                    record.is_enabled(key)
                );
            }
        }
    }

    #[test]
    fn test_missing_keys_project_as_enabled() {
        let projection = project(&PreferencesRecord::new());
        assert_eq!(projection.status, SubscriptionStatus::Subscribed);
        assert_eq!(projection.active_tags.len(), PreferenceKey::ALL.len());

        let partial = PreferencesRecord::new().with(PreferenceKey::MarketingEmails, false);
        assert_eq!(project(&partial), project(&partial.with_defaults().0));
    }

    #[test]
    fn test_single_marketing_opt_in() {
        let record = PreferencesRecord::all(false).with(PreferenceKey::MarketingEmails, true);
        let projection = project(&record);

        assert_eq!(projection.status, SubscriptionStatus::Subscribed);
        assert_eq!(projection.active_tag_names(), vec!["Marketing Emails"]);
    }

    #[test]
    fn test_deterministic() {
        let record = PreferencesRecord::all(false).with(PreferenceKey::ProductUpdates, true);
        assert_eq!(project(&record), project(&record));
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(SubscriptionStatus::Subscribed.as_str(), "subscribed");
        assert_eq!(
            serde_json::to_value(SubscriptionStatus::Unsubscribed).unwrap(),
            serde_json::json!("unsubscribed")
        );
    }
}
