// # Preferences Store Implementations
//
// This module provides implementations of the PreferencesStore trait for
// different persistence strategies.

pub mod file;
pub mod memory;

pub use file::FilePreferencesStore;
pub use memory::MemoryPreferencesStore;
