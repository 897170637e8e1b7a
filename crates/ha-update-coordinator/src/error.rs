//! Fetch failure classification

use std::time::Duration;

use ha_config_entries::ConfigEntryError;
use thiserror::Error;

/// Why one fetch cycle failed
///
/// Cloneable so every caller joined on the same in-flight fetch receives
/// the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// Transient vendor failure (connection refused, bad response, rate limit)
    #[error("{message}")]
    Failed {
        message: String,
        /// Vendor asked us to come back after this long
        retry_after: Option<Duration>,
    },

    #[error("timeout fetching data after {0:?}")]
    Timeout(Duration),

    /// Credentials were rejected; retrying will not help
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Unclassified error raised by the data source
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl UpdateError {
    pub fn failed(message: impl Into<String>) -> Self {
        UpdateError::Failed {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn failed_retry_after(message: impl Into<String>, retry_after: Duration) -> Self {
        UpdateError::Failed {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        UpdateError::AuthFailed(message.into())
    }

    /// Polling keeps going for everything except auth failures
    pub fn is_transient(&self) -> bool {
        !self.is_auth_failure()
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, UpdateError::AuthFailed(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpdateError::Failed { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<anyhow::Error> for UpdateError {
    fn from(err: anyhow::Error) -> Self {
        UpdateError::Unexpected(format!("{err:#}"))
    }
}

/// Classify a failed first refresh for config entry setup
///
/// Auth failures abort setup and ask for new credentials, anything else
/// makes the entry retry later.
impl From<UpdateError> for ConfigEntryError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::AuthFailed(message) => ConfigEntryError::AuthFailed(message),
            other => ConfigEntryError::NotReady(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(UpdateError::failed("connection refused").is_transient());
        assert!(UpdateError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(UpdateError::Unexpected("bug".into()).is_transient());

        let auth = UpdateError::auth_failed("token expired");
        assert!(auth.is_auth_failure());
        assert!(!auth.is_transient());
    }

    #[test]
    fn test_retry_after_only_on_failed() {
        let err = UpdateError::failed_retry_after("rate limited", Duration::from_secs(90));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(90)));
        assert_eq!(err.to_string(), "rate limited");

        assert_eq!(UpdateError::failed("x").retry_after(), None);
        assert_eq!(UpdateError::Timeout(Duration::from_secs(1)).retry_after(), None);
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("socket closed").context("reading station payload");
        let err = UpdateError::from(err);
        assert_eq!(
            err,
            UpdateError::Unexpected("reading station payload: socket closed".into())
        );
    }

    #[test]
    fn test_setup_classification() {
        assert_eq!(
            ConfigEntryError::from(UpdateError::auth_failed("bad key")),
            ConfigEntryError::AuthFailed("bad key".into())
        );
        assert_eq!(
            ConfigEntryError::from(UpdateError::Timeout(Duration::from_secs(30))),
            ConfigEntryError::NotReady("timeout fetching data after 30s".into())
        );
        assert_eq!(
            ConfigEntryError::from(UpdateError::failed("offline")),
            ConfigEntryError::NotReady("offline".into())
        );
    }
}
