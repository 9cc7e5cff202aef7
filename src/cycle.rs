//! Per-community timer lifecycle.
//!
//! The haunting chain is modeled as an explicit state machine rather than a
//! self-rescheduling callback: the scheduler emits events and this module
//! decides whether the transition is legal. Cancel is always legal (it is
//! the first half of every cancel-then-arm), so a stray cancel never wedges
//! a community.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No armed timer; the chain is stopped.
    Idle,
    /// A timer is armed for the next appearance.
    Armed,
    /// The timer completed and the reveal is being processed.
    Firing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    Arm,
    Cancel,
    Fire,
    /// The reveal finished and the paused flag stopped the chain.
    Pause,
}

impl CycleEvent {
    /// Phase the event drives toward, used to force progress after a
    /// transition defect is logged.
    pub fn target(&self) -> CyclePhase {
        match self {
            CycleEvent::Arm => CyclePhase::Armed,
            CycleEvent::Cancel => CyclePhase::Idle,
            CycleEvent::Fire => CyclePhase::Firing,
            CycleEvent::Pause => CyclePhase::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: CyclePhase,
    pub event: CycleEvent,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cycle transition {:?} on {:?}", self.event, self.from)
    }
}

pub fn apply_event(phase: CyclePhase, event: CycleEvent) -> Result<CyclePhase, TransitionError> {
    match (phase, event) {
        (CyclePhase::Idle, CycleEvent::Arm) => Ok(CyclePhase::Armed),
        (_, CycleEvent::Cancel) => Ok(CyclePhase::Idle),
        (CyclePhase::Armed, CycleEvent::Fire) => Ok(CyclePhase::Firing),
        // The recursive re-arm after a reveal.
        (CyclePhase::Firing, CycleEvent::Arm) => Ok(CyclePhase::Armed),
        (CyclePhase::Firing, CycleEvent::Pause) => Ok(CyclePhase::Idle),
        (from, event) => Err(TransitionError { from, event }),
    }
}
