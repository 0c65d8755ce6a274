// # Mailing List Client Trait
//
// Defines the interface for the external mailing-list service.
//
// ## Implementations
//
// - Mailchimp: `prefsync-provider-mailchimp` crate
// - Test doubles: `tests/common/mod.rs`
//
// ## Usage
//
// ```rust,ignore
// use prefsync_core::{MailingListClient, MemberUpsert};
//
// let target = config.mailing_list.resolve()?;
// client.upsert_member(&target, "user@example.com", &upsert).await?;
// client.update_member_tags(&target, "user@example.com", &transitions).await?;
// ```

use crate::projection::{SubscriptionProjection, SubscriptionStatus};
use crate::reconcile::TagTransition;
use async_trait::async_trait;

/// Resolved call target: credentials, routing, and list
///
/// Produced by [`MailingListConfig::resolve`](crate::config::MailingListConfig::resolve),
/// so every field is known to be present.
#[derive(Clone, PartialEq, Eq)]
pub struct ListTarget {
    api_key: String,
    server_prefix: String,
    list_id: String,
}

impl ListTarget {
    /// Create a target from resolved values
    pub fn new(
        api_key: impl Into<String>,
        server_prefix: impl Into<String>,
        list_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            server_prefix: server_prefix.into(),
            list_id: list_id.into(),
        }
    }

    /// API key (never log this value)
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Server prefix / region routing
    pub fn server_prefix(&self) -> &str {
        &self.server_prefix
    }

    /// List identifier
    pub fn list_id(&self) -> &str {
        &self.list_id
    }
}

// Custom Debug implementation that hides the API key
impl std::fmt::Debug for ListTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListTarget")
            .field("api_key", &"<REDACTED>")
            .field("server_prefix", &self.server_prefix)
            .field("list_id", &self.list_id)
            .finish()
    }
}

/// Full member state sent by the upsert call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUpsert {
    /// Overall status
    pub status: SubscriptionStatus,
    /// Active tag names
    pub tags: Vec<String>,
}

impl From<&SubscriptionProjection> for MemberUpsert {
    fn from(projection: &SubscriptionProjection) -> Self {
        Self {
            status: projection.status,
            tags: projection.active_tag_names(),
        }
    }
}

/// Trait for mailing-list service clients
///
/// # Trust Level: Untrusted
///
/// Clients are isolated, single-shot integrations:
///
/// - ✅ Perform HTTP calls to their service only
/// - ✅ Report failures with the HTTP status when one was received
/// - ❌ Retry or back off (owned by the engine via `execute_with_retry`)
/// - ❌ Access the preference store (owned by `SyncEngine`)
/// - ❌ Cache member state between calls
///
/// Failures must be [`Error::Service`](crate::Error::Service) with `status`
/// set whenever the service answered, so the engine can tell rate limits and
/// server errors (retryable) from validation errors (fatal).
#[async_trait]
pub trait MailingListClient: Send + Sync {
    /// Create or fully replace a list member
    ///
    /// # Idempotency
    ///
    /// Re-sending identical data must converge to the same remote state.
    ///
    /// # Parameters
    ///
    /// - `target`: Resolved credentials and list
    /// - `address`: Member contact address
    /// - `member`: Status and active tags
    async fn upsert_member(
        &self,
        target: &ListTarget,
        address: &str,
        member: &MemberUpsert,
    ) -> Result<(), crate::Error>;

    /// Apply incremental tag-state changes to an existing member
    ///
    /// # Parameters
    ///
    /// - `target`: Resolved credentials and list
    /// - `address`: Member contact address
    /// - `transitions`: De-duplicated tag directives
    async fn update_member_tags(
        &self,
        target: &ListTarget,
        address: &str,
        transitions: &[TagTransition],
    ) -> Result<(), crate::Error>;

    /// Get the client name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}
