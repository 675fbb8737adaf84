//! Per-child conversation state machine.
//!
//! Every parent keeps one [`ProtocolMachine`] per child and feeds it the
//! events it observes on that child's channel. Illegal sequences are
//! reported as [`InvalidTransition`]; the machine keeps its state so a
//! stray message cannot corrupt it. Callers log the violation and carry
//! on, the protocol treats it as non-fatal.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the conversation with one child stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolState {
    WaitingForHeartBeat,
    SearchingForProperties,
    DecidingContinuation,
    WaitingForProperties,
}

/// Something observed on the channel, or decided by the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolEvent {
    Heartbeat,
    SearchFinished,
    NeedRestart,
    ExperimentRequested,
    DecideContinuation,
    FoundProperty,
    PropertiesSent,
    Terminated,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An event arrived in a state that declares no transition for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {state} on {event}")]
pub struct InvalidTransition {
    pub state: ProtocolState,
    pub event: ProtocolEvent,
}

/// The transition table.
///
/// `ExperimentRequested` moves exactly like `SearchFinished`, and
/// `NeedRestart` is also accepted while properties are pending so that a
/// restart request in any later round is legal.
pub fn transition(
    state: ProtocolState,
    event: ProtocolEvent,
) -> Result<ProtocolState, InvalidTransition> {
    use ProtocolEvent as E;
    use ProtocolState as S;

    match (state, event) {
        (S::WaitingForHeartBeat, E::Heartbeat) => Ok(S::SearchingForProperties),
        (
            S::SearchingForProperties,
            E::SearchFinished | E::NeedRestart | E::ExperimentRequested,
        ) => Ok(S::DecidingContinuation),
        (S::DecidingContinuation, E::DecideContinuation) => Ok(S::WaitingForProperties),
        (S::WaitingForProperties, E::FoundProperty) => Ok(S::WaitingForProperties),
        (
            S::WaitingForProperties,
            E::SearchFinished | E::NeedRestart | E::ExperimentRequested | E::PropertiesSent,
        ) => Ok(S::DecidingContinuation),
        (S::WaitingForProperties, E::Heartbeat) => Ok(S::SearchingForProperties),
        (S::WaitingForProperties, E::Terminated) => Ok(S::WaitingForHeartBeat),
        (state, event) => Err(InvalidTransition { state, event }),
    }
}

/// One child's conversation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMachine {
    state: ProtocolState,
    violations: u32,
}

impl ProtocolMachine {
    pub fn new() -> Self {
        ProtocolMachine {
            state: ProtocolState::WaitingForHeartBeat,
            violations: 0,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Number of rejected events since creation.
    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Applies `event`; on error the state is left untouched.
    pub fn fire(&mut self, event: ProtocolEvent) -> Result<ProtocolState, InvalidTransition> {
        match transition(self.state, event) {
            Ok(next) => {
                self.state = next;
                Ok(next)
            }
            Err(err) => {
                self.violations += 1;
                Err(err)
            }
        }
    }
}

impl Default for ProtocolMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ProtocolEvent as E;
    use ProtocolState as S;

    #[test]
    fn full_round_then_terminate() {
        let mut m = ProtocolMachine::new();
        assert_eq!(m.fire(E::Heartbeat), Ok(S::SearchingForProperties));
        assert_eq!(m.fire(E::SearchFinished), Ok(S::DecidingContinuation));
        assert_eq!(m.fire(E::DecideContinuation), Ok(S::WaitingForProperties));
        assert_eq!(m.fire(E::FoundProperty), Ok(S::WaitingForProperties));
        assert_eq!(m.fire(E::FoundProperty), Ok(S::WaitingForProperties));
        assert_eq!(m.fire(E::PropertiesSent), Ok(S::DecidingContinuation));
        assert_eq!(m.fire(E::DecideContinuation), Ok(S::WaitingForProperties));
        assert_eq!(m.fire(E::Terminated), Ok(S::WaitingForHeartBeat));
        assert_eq!(m.violations(), 0);
    }

    #[test]
    fn later_round_restarts_from_heartbeat() {
        let mut m = ProtocolMachine::new();
        m.fire(E::Heartbeat).unwrap();
        m.fire(E::NeedRestart).unwrap();
        m.fire(E::DecideContinuation).unwrap();
        assert_eq!(m.fire(E::Heartbeat), Ok(S::SearchingForProperties));
    }

    #[test]
    fn invalid_event_keeps_state() {
        let mut m = ProtocolMachine::new();
        let err = m.fire(E::PropertiesSent).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                state: S::WaitingForHeartBeat,
                event: E::PropertiesSent
            }
        );
        assert_eq!(m.state(), S::WaitingForHeartBeat);
        assert_eq!(m.violations(), 1);
        assert_eq!(
            err.to_string(),
            "no transition from WaitingForHeartBeat on PropertiesSent"
        );
    }

    #[test]
    fn properties_sent_before_search_finished_is_rejected() {
        let mut m = ProtocolMachine::new();
        m.fire(E::Heartbeat).unwrap();
        assert!(m.fire(E::PropertiesSent).is_err());
        assert_eq!(m.state(), S::SearchingForProperties);
    }

    #[test]
    fn every_pair_is_either_declared_or_rejected() {
        let states = [
            S::WaitingForHeartBeat,
            S::SearchingForProperties,
            S::DecidingContinuation,
            S::WaitingForProperties,
        ];
        let events = [
            E::Heartbeat,
            E::SearchFinished,
            E::NeedRestart,
            E::ExperimentRequested,
            E::DecideContinuation,
            E::FoundProperty,
            E::PropertiesSent,
            E::Terminated,
        ];
        let legal: usize = states
            .iter()
            .flat_map(|&s| events.iter().map(move |&e| transition(s, e)))
            .filter(Result::is_ok)
            .count();
        assert_eq!(legal, 12);
    }
}
