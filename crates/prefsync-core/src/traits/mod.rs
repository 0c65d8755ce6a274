//! Capability traits supplied by collaborators
//!
//! - [`MailingListClient`]: Upsert members and update tags on the mailing-list service
//! - [`PreferencesStore`]: Read, merge, create, and delete preference records

pub mod mailing_list;
pub mod preferences_store;

pub use mailing_list::{ListTarget, MailingListClient, MemberUpsert};
pub use preferences_store::PreferencesStore;
