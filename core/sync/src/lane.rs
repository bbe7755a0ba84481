//! Per-key lane state machine.
//!
//! A lane owns the replay of one resource key. It has at most one send
//! outstanding; the next operation of the key is only looked at once the
//! previous one settled or went back to `Pending`.

use std::fmt;
use std::time::Duration;

use outbox_common::{Error, OperationId, Result};

/// Current state of a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneState {
    /// Waiting for work, or holding work while offline.
    Idle,
    /// One operation is on the wire.
    Sending { op: OperationId, attempt: u32 },
    /// Waiting before resending a retryable failure.
    BackingOff {
        op: OperationId,
        attempt: u32,
        delay: Duration,
    },
    /// The worker shut down.
    Stopped,
}

/// Something that happened to a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneEvent {
    /// The head operation was marked in flight and is being sent.
    Dispatch { op: OperationId, attempt: u32 },
    /// The send finished: committed, failed or rebased for a resend.
    Settled,
    /// The send failed with a retryable error.
    Retry { delay: Duration },
    /// Backoff elapsed or connectivity returned.
    Wake,
    /// The worker is shutting down.
    Stop,
}

impl LaneState {
    /// Compute the next state.
    ///
    /// # Errors
    /// - `InvalidTransition` if `event` cannot happen in this state
    pub fn on(&self, event: LaneEvent) -> Result<LaneState> {
        use LaneEvent as E;
        use LaneState as S;

        let next = match (self, &event) {
            (S::Stopped, _) => None,
            (_, E::Stop) => Some(S::Stopped),
            (S::Idle, E::Dispatch { op, attempt }) => Some(S::Sending {
                op: *op,
                attempt: *attempt,
            }),
            (S::Idle, E::Wake) => Some(S::Idle),
            (S::Sending { .. }, E::Settled) => Some(S::Idle),
            (S::Sending { op, attempt }, E::Retry { delay }) => Some(S::BackingOff {
                op: *op,
                attempt: *attempt,
                delay: *delay,
            }),
            (S::BackingOff { .. }, E::Wake) => Some(S::Idle),
            _ => None,
        };

        next.ok_or_else(|| {
            Error::InvalidTransition(format!("lane cannot handle {:?} while {}", event, self))
        })
    }

    pub fn is_sending(&self) -> bool {
        matches!(self, LaneState::Sending { .. })
    }
}

impl fmt::Display for LaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneState::Idle => write!(f, "idle"),
            LaneState::Sending { op, attempt } => write!(f, "sending {} (attempt {})", op, attempt),
            LaneState::BackingOff { op, delay, .. } => {
                write!(f, "backing off {} for {:?}", op, delay)
            }
            LaneState::Stopped => write!(f, "stopped"),
        }
    }
}
