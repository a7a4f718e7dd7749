//! Saga and step state machines.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► Running ──┬──► Completed
///    │                  ├──► Timeout
///    │                  ├──► Failed ──► Compensating
///    │                  ├──► Compensating ──┬──► Compensated
///    │                  │                   ├──► Cancelled
///    │                  │                   └──► CompensationFailed ──► Compensating
///    └──────────────────┴──► Cancelled
/// ```
///
/// `Failed` is terminal when there was nothing to compensate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Instantiated from a definition, not yet driven.
    #[default]
    Created,

    /// Levels are being executed.
    Running,

    /// Every step completed or was skipped (terminal).
    Completed,

    /// A step failed irrecoverably.
    Failed,

    /// Completed steps are being compensated.
    Compensating,

    /// Compensation finished (terminal).
    Compensated,

    /// A non-best-effort compensating call failed; needs an operator.
    CompensationFailed,

    /// Cancelled by a caller (terminal).
    Cancelled,

    /// Expired with nothing to compensate (terminal).
    Timeout,
}

impl SagaStatus {
    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
                | (Running, Compensating)
                | (Failed, Compensating)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
                | (Compensating, Cancelled)
                | (CompensationFailed, Compensating)
        )
    }

    /// Returns true if the saga can be cancelled in this status.
    pub fn can_cancel(&self) -> bool {
        matches!(self, SagaStatus::Created | SagaStatus::Running)
    }

    /// Returns true if no further transition is accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Compensated
                | SagaStatus::Cancelled
                | SagaStatus::Timeout
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Created => "created",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::CompensationFailed => "compensation_failed",
            SagaStatus::Cancelled => "cancelled",
            SagaStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of a single step within a saga.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Running ──┬──► Completed ──► Compensating ──┬──► Compensated
///           │              ├──► Failed                       └──► CompensationFailed
///           │              ├──► Timeout                              │
///           │              └──► Retrying ──► Running                 │
///           │                       └──► Failed       Compensating ◄─┘
///           └──► Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not dispatched yet.
    #[default]
    Pending,

    /// Dispatched, awaiting the call result.
    Running,

    /// Last attempt failed; waiting out the backoff before redispatch.
    Retrying,

    /// Call succeeded.
    Completed,

    /// Call failed and won't be retried (terminal).
    Failed,

    /// Activation conditions rejected the step (terminal).
    Skipped,

    /// Call exceeded its timeout and won't be retried (terminal).
    Timeout,

    /// Compensation requested (in flight or waiting for an operator).
    Compensating,

    /// Compensation succeeded (terminal).
    Compensated,

    /// Compensating call failed.
    CompensationFailed,
}

impl StepStatus {
    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Completed, Compensating)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
                | (CompensationFailed, Compensating)
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Timeout => "timeout",
            StepStatus::Compensating => "compensating",
            StepStatus::Compensated => "compensated",
            StepStatus::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
