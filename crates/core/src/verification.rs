use thiserror::Error;

use crate::types::DomainStage;

/// Inputs that move a domain through its verification stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// A verification job was enqueued (initial check or manual re-check).
    Enqueued,
    ProbeSucceeded,
    ProbeFailed,
    /// The job system gave up on a stuck or repeatedly failing check.
    TimedOut,
}

impl StageEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::ProbeSucceeded => "probe_succeeded",
            Self::ProbeFailed => "probe_failed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {} to a domain in stage {from}", .event.as_str())]
pub struct TransitionError {
    pub from: DomainStage,
    pub event: StageEvent,
}

impl DomainStage {
    /// Applies `event` to the stage, returning the next stage.
    ///
    /// Every stage may be re-entered into `Checking`; only `Checking` reaches a verdict.
    pub fn apply(self, event: StageEvent) -> Result<DomainStage, TransitionError> {
        match (self, event) {
            (_, StageEvent::Enqueued) => Ok(DomainStage::Checking),
            (DomainStage::Checking, StageEvent::ProbeSucceeded) => Ok(DomainStage::Success),
            (DomainStage::Checking, StageEvent::ProbeFailed | StageEvent::TimedOut) => {
                Ok(DomainStage::Error)
            }
            (from, event) => Err(TransitionError { from, event }),
        }
    }
}
