//! Config Entries
//!
//! Config entries represent individual integration instances and manage
//! their lifecycle (setup, retry, reauth, unload).
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration instance and its runtime state
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntryError`] - Classified setup failure
//! - [`ConfigEntries`] - Manager for all config entries

pub mod entry;
pub mod error;
pub mod manager;
pub mod state_machine;

pub use entry::{ConfigEntry, ConfigEntryState, ReauthRequest, SetupHandler, UnloadCallback};
pub use error::{ConfigEntriesError, ConfigEntriesResult, ConfigEntryError};
pub use manager::ConfigEntries;
pub use state_machine::{calculate_retry_delay, InvalidTransition};
