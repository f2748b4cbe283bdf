//! The transition table.
//!
//! | operation  | allowed from      | passes through | on success |
//! |------------|-------------------|----------------|------------|
//! | start      | Created, Stopped  | Starting       | Running    |
//! | stop       | Running, Paused   | Stopping       | Stopped    |
//! | pause      | Running           |                | Paused     |
//! | resume     | Paused            |                | Running    |
//! | reset      | Failed            |                | Created    |
//! | deregister | Created, Stopped  |                | (removed)  |
//!
//! `start` on a Running sandbox and `stop` on a Created or Stopped one are
//! no-ops. Everything else is an `InvalidTransition`.

use corral_core::{ContainerStatus, CorralError, LifecycleState, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Pause,
    Resume,
    Reset,
    Deregister,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
            Operation::Reset => "reset",
            Operation::Deregister => "deregister",
        }
    }

    /// Where the sandbox ends up when the operation succeeds.
    /// `None` for deregister, which removes the record.
    pub fn target(&self) -> Option<LifecycleState> {
        match self {
            Operation::Start | Operation::Resume => Some(LifecycleState::Running),
            Operation::Stop => Some(LifecycleState::Stopped),
            Operation::Pause => Some(LifecycleState::Paused),
            Operation::Reset => Some(LifecycleState::Created),
            Operation::Deregister => None,
        }
    }

    /// A failed start or stop leaves the sandbox Failed; every other
    /// operation leaves the state where it was.
    pub fn fails_sandbox(&self) -> bool {
        matches!(self, Operation::Start | Operation::Stop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Already where the caller wants it.
    Noop,
    /// Run the operation, recording `via` while it is in flight.
    Proceed { via: Option<LifecycleState> },
}

pub fn plan(id: &str, state: LifecycleState, operation: Operation) -> Result<Plan> {
    use LifecycleState::*;

    let plan = match (operation, state) {
        (Operation::Start, Created | Stopped) => Plan::Proceed { via: Some(Starting) },
        (Operation::Start, Running) => Plan::Noop,
        (Operation::Stop, Running | Paused) => Plan::Proceed { via: Some(Stopping) },
        (Operation::Stop, Created | Stopped) => Plan::Noop,
        (Operation::Pause, Running) => Plan::Proceed { via: None },
        (Operation::Resume, Paused) => Plan::Proceed { via: None },
        (Operation::Reset, Failed) => Plan::Proceed { via: None },
        (Operation::Deregister, Created | Stopped) => Plan::Proceed { via: None },
        _ => {
            return Err(CorralError::InvalidTransition {
                id: id.to_string(),
                state,
                operation: operation.as_str(),
            });
        }
    };
    Ok(plan)
}

/// Container status implied by a settled state. `None` means ask the runtime.
pub fn implied_status(state: LifecycleState) -> Option<ContainerStatus> {
    match state {
        LifecycleState::Running => Some(ContainerStatus::Running),
        LifecycleState::Paused => Some(ContainerStatus::Paused),
        LifecycleState::Created | LifecycleState::Stopped => Some(ContainerStatus::Stopped),
        LifecycleState::Starting | LifecycleState::Stopping | LifecycleState::Failed => None,
    }
}
