//! Setup failure classification and manager errors

use thiserror::Error;

use crate::entry::ConfigEntryState;
use crate::state_machine::InvalidTransition;

/// How an integration's setup failed
///
/// The variant decides what the host does next: retry later, stop and ask
/// for new credentials, or stop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigEntryError {
    /// The device or service is unreachable right now; setup is retried
    #[error("not ready: {0}")]
    NotReady(String),

    /// Credentials were rejected; setup stops and reauth is requested
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Unrecoverable setup error; setup stops
    #[error("setup error: {0}")]
    Error(String),
}

/// Errors from [`ConfigEntries`](crate::ConfigEntries) operations
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("no setup handler registered for domain {0}")]
    NoHandler(String),

    #[error("cannot remove entry in state {0:?}")]
    CannotRemove(ConfigEntryState),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;
