// # prefsync-core
//
// Core library for keeping a mailing-list service in sync with per-user
// notification preferences.
//
// ## Architecture Overview
//
// - **PreferencesRecord**: Per-user boolean opt-in flags, keyed by a closed enum
// - **project()**: Maps a record to the subscription status and active tag set
// - **diff()**: Computes the tag transitions between two records
// - **execute_with_retry()**: Bounded exponential-backoff wrapper for external calls
// - **SyncEngine**: Composes the above into "sync one user" plus lifecycle handlers and backfill
// - **MailingListClient** / **PreferencesStore**: Capabilities supplied by collaborators
//
// ## Design Principles
//
// 1. **Pure core**: Projection and diffing perform no I/O
// 2. **Engine-owned retry**: Clients make one call per invocation, the engine decides when to retry
// 3. **Explicit wiring**: Clients and stores are passed in, never looked up globally
// 4. **Never throw to triggers**: Every sync ends in a logged `SyncOutcome`

pub mod traits;
pub mod engine;
pub mod config;
pub mod error;
pub mod preferences;
pub mod projection;
pub mod reconcile;
pub mod retry;
pub mod state;

// Re-export core types for convenience
pub use traits::{ListTarget, MailingListClient, MemberUpsert, PreferencesStore};
pub use engine::{BackfillReport, PreferencesChange, SyncEngine, SyncEvent, SyncOutcome, SyncStage};
pub use config::{BackfillConfig, EngineConfig, MailingListConfig, RetryConfig, SyncConfig};
pub use error::{Error, Result};
pub use preferences::{PreferenceKey, PreferencesRecord};
pub use projection::{SubscriptionProjection, SubscriptionStatus, project};
pub use reconcile::{TagState, TagTransition, diff};
pub use retry::{RetryPolicy, execute_with_retry};
pub use state::{FilePreferencesStore, MemoryPreferencesStore};
