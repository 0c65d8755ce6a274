//! Tag reconciliation
//!
//! [`diff`] computes the tag-state transitions to send after the member
//! upsert, given the previous preferences (if any) and the current ones.
//!
//! ## Rules
//!
//! 1. Enabled before, disabled now: tag goes inactive
//! 2. Enabled now, not enabled before (or no previous record): tag goes active
//! 3. No previous record and every key disabled: every disabled tag goes
//!    inactive, so a brand-new opted-out member starts from a known state
//!
//! "Enabled before" means the previous record stored `true` for the key. A
//! key the previous record never stored does not count, which makes a key
//! that was just filled in with its default produce an explicit activation.

use crate::preferences::{PreferenceKey, PreferencesRecord};
use crate::projection::{SubscriptionStatus, project};
use serde::{Deserialize, Serialize};

/// Desired state of a tag on the mailing-list service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagState {
    /// Tag applied
    Active,
    /// Tag removed
    Inactive,
}

impl TagState {
    /// Wire value
    pub fn as_str(self) -> &'static str {
        match self {
            TagState::Active => "active",
            TagState::Inactive => "inactive",
        }
    }
}

/// A directive to set one tag to a state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagTransition {
    /// Tag name on the mailing-list service
    #[serde(rename = "name")]
    pub tag_name: String,
    /// Desired state
    #[serde(rename = "status")]
    pub desired_state: TagState,
}

impl TagTransition {
    /// Directive to activate a preference's tag
    pub fn activate(key: PreferenceKey) -> Self {
        Self {
            tag_name: key.tag_name().to_string(),
            desired_state: TagState::Active,
        }
    }

    /// Directive to deactivate a preference's tag
    pub fn deactivate(key: PreferenceKey) -> Self {
        Self {
            tag_name: key.tag_name().to_string(),
            desired_state: TagState::Inactive,
        }
    }
}

/// Compute the tag transitions from `previous` to `current`
///
/// The result holds at most one directive per tag. Deactivations are listed
/// before activations; callers must not depend on the order.
pub fn diff(previous: Option<&PreferencesRecord>, current: &PreferencesRecord) -> Vec<TagTransition> {
    let was_enabled = |key: PreferenceKey| previous.is_some_and(|p| p.get(key) == Some(true));

    let mut computed = Vec::new();

    match previous {
        Some(_) => {
            for key in PreferenceKey::ALL {
                if was_enabled(key) && !current.is_enabled(key) {
                    computed.push(TagTransition::deactivate(key));
                }
            }
        }
        None if project(current).status == SubscriptionStatus::Unsubscribed => {
            for key in PreferenceKey::ALL {
                if !current.is_enabled(key) {
                    computed.push(TagTransition::deactivate(key));
                }
            }
        }
        None => {}
    }

    for key in PreferenceKey::ALL {
        if current.is_enabled(key) && !was_enabled(key) {
            computed.push(TagTransition::activate(key));
        }
    }

    dedup_transitions(computed)
}

/// Collapse directives to one per tag, keeping the most recently computed
fn dedup_transitions(computed: Vec<TagTransition>) -> Vec<TagTransition> {
    let mut result: Vec<TagTransition> = Vec::with_capacity(computed.len());
    for transition in computed {
        if let Some(index) = result.iter().position(|t| t.tag_name == transition.tag_name) {
            let existing = result.remove(index);
            if existing.desired_state != transition.desired_state {
                tracing::warn!(
                    "Conflicting directives for tag {}: {} replaced by {}",
                    transition.tag_name,
                    existing.desired_state.as_str(),
                    transition.desired_state.as_str()
                );
            }
        }
        result.push(transition);
    }
    result
}

/// Whether any tag is both activated and deactivated in `transitions`
pub fn has_conflicting_directives(transitions: &[TagTransition]) -> bool {
    transitions.iter().any(|a| {
        transitions
            .iter()
            .any(|b| a.tag_name == b.tag_name && a.desired_state != b.desired_state)
    })
}
