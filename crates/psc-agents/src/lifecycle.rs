//! Frontend lifecycle state machine.
//!
//! Bring-up is a fixed sequence of setup steps, each of which moves the
//! machine forward by exactly one state. After `InitializationComplete` the
//! machine is `Initializing` until the run starts, then `Running`, then
//! `Finalizing`. There is no way back.
//!
//! Unlike the per-child protocol machine, an illegal event here is fatal:
//! it means the frontend's own orchestration code is out of order, so
//! [`LifecycleMachine::fire`] returns a [`LifecycleError`] and the run stops.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    InitializingDataStructures,
    ParsingParameters,
    SettingDebug,
    SelectingHierarchySetupMode,
    SettingNetwork,
    SettingApplicationData,
    SettingPhases,
    SettingProcesses,
    SettingThreads,
    SettingTimeouts,
    SettingAgents,
    SettingOutputfile,
    ConnectingToRegistry,
    SelectingStarter,
    InitializationComplete,
    Running,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    InitDataStructures,
    ParseParameters,
    SetupDebug,
    SelectHierarchySetupMode,
    SetupNetwork,
    SetupApplicationData,
    SetupPhases,
    SetupProcesses,
    SetupThreads,
    SetupTimeouts,
    SetupAgents,
    SetupOutputfile,
    ConnectToRegistry,
    SelectStarter,
    StartRun,
    Finalize,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frontend lifecycle: no transition from {state} on {event}")]
pub struct LifecycleError {
    pub state: LifecycleState,
    pub event: LifecycleEvent,
}

/// The transition table.
pub fn transition(
    state: LifecycleState,
    event: LifecycleEvent,
) -> Result<LifecycleState, LifecycleError> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    let next = match (state, event) {
        (S::InitializingDataStructures, E::InitDataStructures) => S::ParsingParameters,
        (S::ParsingParameters, E::ParseParameters) => S::SettingDebug,
        (S::SettingDebug, E::SetupDebug) => S::SelectingHierarchySetupMode,
        (S::SelectingHierarchySetupMode, E::SelectHierarchySetupMode) => S::SettingNetwork,
        (S::SettingNetwork, E::SetupNetwork) => S::SettingApplicationData,
        (S::SettingApplicationData, E::SetupApplicationData) => S::SettingPhases,
        (S::SettingPhases, E::SetupPhases) => S::SettingProcesses,
        (S::SettingProcesses, E::SetupProcesses) => S::SettingThreads,
        (S::SettingThreads, E::SetupThreads) => S::SettingTimeouts,
        (S::SettingTimeouts, E::SetupTimeouts) => S::SettingAgents,
        (S::SettingAgents, E::SetupAgents) => S::SettingOutputfile,
        (S::SettingOutputfile, E::SetupOutputfile) => S::ConnectingToRegistry,
        (S::ConnectingToRegistry, E::ConnectToRegistry) => S::SelectingStarter,
        (S::SelectingStarter, E::SelectStarter) => S::InitializationComplete,
        (S::InitializationComplete, E::StartRun) => S::Running,
        (S::Running, E::Finalize) => S::Finalizing,
        (state, event) => return Err(LifecycleError { state, event }),
    };
    Ok(next)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleMachine {
    state: LifecycleState,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        LifecycleMachine {
            state: LifecycleState::InitializingDataStructures,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn fire(&mut self, event: LifecycleEvent) -> Result<LifecycleState, LifecycleError> {
        let next = transition(self.state, event)?;
        tracing::debug!(from = %self.state, to = %next, %event, "frontend lifecycle");
        self.state = next;
        Ok(next)
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}
