use std::time::Duration;

use crate::retry::RetryPolicy;

/// Lifecycle of one quarantined item.
///
/// `Received` and `Retrying` are waiting for the outcome of a validation attempt,
/// `Recovered` and `Exhausted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineState {
    /// Attempt 1 is about to run, without any wait.
    Received,
    /// Attempt `attempt` runs once `backoff` has elapsed.
    Retrying { attempt: u32, backoff: Duration },
    Recovered { attempts: u32 },
    /// `aborted` is set when shutdown interrupted a backoff before the ceiling was reached.
    Exhausted { attempts: u32, aborted: bool },
}

impl QuarantineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QuarantineState::Recovered { .. } | QuarantineState::Exhausted { .. }
        )
    }

    /// The attempt the next `Passed`/`Failed` event reports on, if any.
    pub fn pending_attempt(&self) -> Option<u32> {
        match self {
            QuarantineState::Received => Some(1),
            QuarantineState::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Passed,
    Failed,
    /// Shutdown was requested while waiting for the next attempt.
    Cancelled,
}

pub fn transition(state: QuarantineState, event: Event, policy: &RetryPolicy) -> QuarantineState {
    let Some(attempt) = state.pending_attempt() else {
        return state;
    };

    match event {
        Event::Passed => QuarantineState::Recovered { attempts: attempt },
        Event::Failed if attempt >= policy.max_attempts() => QuarantineState::Exhausted {
            attempts: attempt,
            aborted: false,
        },
        Event::Failed => QuarantineState::Retrying {
            attempt: attempt + 1,
            backoff: policy.delay_before(attempt + 1),
        },
        Event::Cancelled => QuarantineState::Exhausted {
            attempts: attempt - 1,
            aborted: true,
        },
    }
}
