//! Engine states, the actions that drive them, and the transition table.

use crate::Error;
use serde::Serialize;

/// Top-level state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    NotStarted,
    Configuring,
    /// Opening one subscription per model
    Subscribing,
    /// Initial sync orchestrator running
    SyncingInitial,
    /// Waiting for subscriptions to be live before the outbox drains
    MutationsPaused,
    DrainingOutgoing,
    Synced,
    /// Network unavailable; local writes still accepted
    Paused,
    CleaningUp,
    SchedulingRestart,
    Stopped,
}

impl EngineState {
    /// States that own network-facing workers.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngineState::Subscribing
                | EngineState::SyncingInitial
                | EngineState::MutationsPaused
                | EngineState::DrainingOutgoing
                | EngineState::Synced
        )
    }

    /// Between `start()` and reaching `Stopped`.
    pub fn is_running(self) -> bool {
        !matches!(self, EngineState::NotStarted | EngineState::Stopped)
    }
}

/// Where the engine goes once cleanup has released every worker.
#[derive(Debug, Clone, PartialEq)]
pub enum AfterCleanup {
    Pause,
    Restart(Error),
    Stop(Option<Error>),
}

/// Input to the state machine. Host requests and phase completions alike.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Start,
    Stop,
    NetworkChanged(bool),
    Configured { online: bool },
    SubscriptionsEstablished,
    InitialSyncCompleted,
    SubscriptionsReady,
    OutgoingStarted,
    Failed(Error),
    ConnectionLost(Error),
    CleanupComplete(AfterCleanup),
    RestartDue,
}

/// The transition table. `None` means the action is ignored in `state`.
pub fn resolve(state: EngineState, action: &EngineAction) -> Option<EngineState> {
    use EngineAction as A;
    use EngineState as S;

    let next = match (state, action) {
        (S::NotStarted | S::Stopped, A::Start) => S::Configuring,

        (S::Configuring, A::Configured { online: true }) => S::Subscribing,
        (S::Configuring, A::Configured { online: false }) => S::Paused,
        (S::Configuring, A::Failed(_)) => S::Stopped,

        (S::Subscribing, A::SubscriptionsEstablished) => S::SyncingInitial,
        (S::SyncingInitial, A::InitialSyncCompleted) => S::MutationsPaused,
        (S::MutationsPaused, A::SubscriptionsReady) => S::DrainingOutgoing,
        (S::DrainingOutgoing, A::OutgoingStarted) => S::Synced,

        (S::Paused, A::NetworkChanged(true)) => S::Subscribing,

        (S::SchedulingRestart, A::RestartDue) => S::Subscribing,
        (S::SchedulingRestart, A::NetworkChanged(false)) => S::Paused,
        (S::SchedulingRestart, A::Failed(_)) => S::Stopped,

        (S::CleaningUp, A::CleanupComplete(after)) => match after {
            AfterCleanup::Pause => S::Paused,
            AfterCleanup::Restart(_) => S::SchedulingRestart,
            AfterCleanup::Stop(_) => S::Stopped,
        },

        (s, A::Failed(_) | A::ConnectionLost(_) | A::NetworkChanged(false)) if s.is_active() => {
            S::CleaningUp
        }
        (s, A::Stop) if s.is_running() && s != S::CleaningUp => S::CleaningUp,

        _ => return None,
    };
    Some(next)
}
