//! Config entry lifecycle transitions
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress (manual retry)
//!                            ↘ SetupRetry → SetupInProgress (scheduled retry)
//!
//! Loaded/SetupError/SetupRetry → UnloadInProgress → NotLoaded
//!                                                 ↘ FailedUnload (terminal)
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::entry::ConfigEntryState;

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid config entry transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// Move to `to`, or explain why that is not allowed from here
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let reason = match (self, to) {
            (NotLoaded, SetupInProgress)
            | (SetupInProgress, Loaded | SetupError | SetupRetry)
            | (SetupError | SetupRetry, SetupInProgress)
            | (Loaded | SetupError | SetupRetry, UnloadInProgress)
            | (UnloadInProgress, NotLoaded | FailedUnload) => return Ok(to),

            (FailedUnload, _) => "FailedUnload is terminal",
            (SetupInProgress, _) => "setup must finish first",
            (UnloadInProgress, _) => "unload must finish first",
            (Loaded, SetupInProgress) => "already loaded, unload before setting up again",
            (NotLoaded, _) => "entry is not loaded, set it up first",
            _ => "invalid state transition",
        };

        Err(InvalidTransition {
            from: self,
            to,
            reason,
        })
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }
}

/// Delay before setup attempt number `tries + 1` after a not-ready failure
///
/// `2^min(tries, 4) * 5` seconds plus up to 100ms of jitter: 5s, 10s, 20s,
/// 40s, then 80s for every further attempt.
pub fn calculate_retry_delay(tries: u32) -> Duration {
    let base = 2_u64.pow(tries.min(4)) * 5;
    let jitter_ms = rand::random::<u64>() % 100;
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConfigEntryState::*;

    const ALL: [ConfigEntryState; 7] = [
        NotLoaded,
        SetupInProgress,
        Loaded,
        SetupError,
        SetupRetry,
        UnloadInProgress,
        FailedUnload,
    ];

    #[test]
    fn test_valid_transitions() {
        let valid = [
            (NotLoaded, SetupInProgress),
            (SetupInProgress, Loaded),
            (SetupInProgress, SetupError),
            (SetupInProgress, SetupRetry),
            (SetupError, SetupInProgress),
            (SetupRetry, SetupInProgress),
            (Loaded, UnloadInProgress),
            (SetupError, UnloadInProgress),
            (SetupRetry, UnloadInProgress),
            (UnloadInProgress, NotLoaded),
            (UnloadInProgress, FailedUnload),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    valid.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn test_failed_unload_is_terminal() {
        for to in ALL {
            let err = FailedUnload.try_transition(to).unwrap_err();
            assert!(err.reason.contains("terminal"));
        }
    }

    #[test]
    fn test_error_display() {
        let err = NotLoaded.try_transition(Loaded).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("NotLoaded"));
        assert!(msg.contains("Loaded"));
        assert!(msg.contains("set it up first"));
    }

    #[test]
    fn test_retry_path() {
        let state = NotLoaded
            .try_transition(SetupInProgress)
            .and_then(|s| s.try_transition(SetupRetry))
            .and_then(|s| s.try_transition(SetupInProgress))
            .and_then(|s| s.try_transition(Loaded))
            .unwrap();
        assert_eq!(state, Loaded);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let expected = [5, 10, 20, 40, 80, 80, 80];
        for (tries, secs) in expected.into_iter().enumerate() {
            let delay = calculate_retry_delay(tries as u32);
            assert!(delay >= Duration::from_secs(secs), "tries={tries}");
            assert!(delay < Duration::from_secs(secs) + Duration::from_millis(100));
        }
    }
}
