//! Lifecycle state machine for a replicator instance.
//!
//! Transitions and reads serialise on a single mutex; `current()` returns a
//! snapshot value. An illegal transition request returns
//! [`Error::InvalidTransition`] and leaves the current state unchanged.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Created,
    Connecting,
    Streaming,
    Paused,
    Reconnecting,
    Error,
    Stopped,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Connecting => "connecting",
            State::Streaming => "streaming",
            State::Paused => "paused",
            State::Reconnecting => "reconnecting",
            State::Error => "error",
            State::Stopped => "stopped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete set of legal transitions.
fn legal(from: State, to: State) -> bool {
    use State::*;
    matches!(
        (from, to),
        (Created, Connecting | Stopped)
            | (Connecting, Streaming | Error | Stopped)
            | (Streaming, Paused | Stopped | Reconnecting | Error)
            | (Paused, Streaming | Stopped | Error)
            | (Reconnecting, Streaming | Error | Stopped)
            | (Error, Connecting | Stopped)
            | (Stopped, Connecting)
    )
}

#[derive(Debug)]
pub struct Fsm {
    current: Mutex<State>,
}

impl Fsm {
    pub fn new() -> Self {
        Self::with_initial_state(State::Created)
    }

    pub fn with_initial_state(state: State) -> Self {
        Self {
            current: Mutex::new(state),
        }
    }

    /// Returns a snapshot of the current state.
    pub fn current(&self) -> State {
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `to` if the transition is legal, returning the previous
    /// state. On an illegal request the state is unchanged.
    pub fn transition(&self, to: State) -> Result<State> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !legal(*current, to) {
            error!(from = %*current, to = %to, "invalid state transition");
            return Err(Error::InvalidTransition {
                from: *current,
                to,
            });
        }

        let previous = *current;
        *current = to;
        info!(state = %to, from = %previous, "state transitioned");
        Ok(previous)
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_created() {
        let fsm = Fsm::new();
        assert_eq!(fsm.current(), State::Created);
    }

    #[test]
    fn happy_path() {
        let fsm = Fsm::new();
        fsm.transition(State::Connecting).unwrap();
        fsm.transition(State::Streaming).unwrap();
        fsm.transition(State::Paused).unwrap();
        fsm.transition(State::Streaming).unwrap();
        fsm.transition(State::Stopped).unwrap();
        assert_eq!(fsm.current(), State::Stopped);
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let fsm = Fsm::new();
        let err = fsm.transition(State::Streaming).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: State::Created,
                to: State::Streaming
            }
        ));
        assert_eq!(fsm.current(), State::Created);
    }

    #[test]
    fn stopped_only_restarts_via_connecting() {
        let fsm = Fsm::with_initial_state(State::Stopped);
        assert!(fsm.transition(State::Streaming).is_err());
        assert!(fsm.transition(State::Paused).is_err());
        fsm.transition(State::Connecting).unwrap();
        assert_eq!(fsm.current(), State::Connecting);
    }

    #[test]
    fn error_state_allows_retry_or_stop() {
        let fsm = Fsm::with_initial_state(State::Error);
        fsm.transition(State::Connecting).unwrap();

        let fsm = Fsm::with_initial_state(State::Error);
        fsm.transition(State::Stopped).unwrap();
    }

    #[test]
    fn reconnecting_returns_to_streaming() {
        let fsm = Fsm::with_initial_state(State::Streaming);
        fsm.transition(State::Reconnecting).unwrap();
        fsm.transition(State::Streaming).unwrap();
    }

    #[test]
    fn legality_table_is_complete() {
        use State::*;
        let all = [
            Created,
            Connecting,
            Streaming,
            Paused,
            Reconnecting,
            Error,
            Stopped,
        ];
        // Spot-check a few pairs absent from the legal set.
        for (from, to) in [
            (Created, Paused),
            (Connecting, Paused),
            (Paused, Reconnecting),
            (Stopped, Streaming),
            (Error, Streaming),
        ] {
            let fsm = Fsm::with_initial_state(from);
            assert!(fsm.transition(to).is_err(), "{from} -> {to} should be illegal");
            assert_eq!(fsm.current(), from);
        }
        // Self-transitions are never legal.
        for state in all {
            let fsm = Fsm::with_initial_state(state);
            assert!(fsm.transition(state).is_err());
        }
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&State::Streaming).unwrap(),
            "\"streaming\""
        );
    }
}
