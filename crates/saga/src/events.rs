//! Saga lifecycle events announced to the platform.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::aggregate::{Saga, SagaStep};
use crate::types::SagaType;

/// Events emitted on saga and step lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga instantiated and persisted.
    SagaCreated(SagaEventData),

    /// Saga began executing its first level.
    SagaStarted(SagaEventData),

    /// Every step completed or was skipped.
    SagaCompleted(SagaEventData),

    /// A step failed irrecoverably.
    SagaFailed(SagaReasonData),

    /// Rollback of completed steps started.
    SagaCompensating(SagaReasonData),

    /// Rollback finished.
    SagaCompensated(SagaEventData),

    /// Rollback halted on a failed compensating call.
    SagaCompensationFailed(SagaReasonData),

    /// Saga cancelled by a caller.
    SagaCancelled(SagaReasonData),

    /// Saga exceeded its timeout.
    SagaTimedOut(SagaEventData),

    /// A step completed.
    StepCompleted(StepEventData),

    /// A step failed and won't be retried.
    StepFailed(StepEventData),

    /// A step's conditions didn't hold.
    StepSkipped(StepEventData),

    /// A step exceeded its timeout and won't be retried.
    StepTimedOut(StepEventData),

    /// A step's compensation succeeded.
    StepCompensated(StepEventData),

    /// A step's compensating call failed.
    StepCompensationFailed(StepEventData),
}

/// Fields shared by every saga-level event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEventData {
    pub saga_id: SagaId,
    pub saga_type: SagaType,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Saga-level event carrying a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaReasonData {
    #[serde(flatten)]
    pub saga: SagaEventData,
    pub reason: String,
}

/// Step-level event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEventData {
    #[serde(flatten)]
    pub saga: SagaEventData,
    pub step_name: String,
    pub error: Option<String>,
}

impl SagaEventData {
    fn of(saga: &Saga, at: DateTime<Utc>) -> Self {
        Self {
            saga_id: saga.id,
            saga_type: saga.saga_type,
            correlation_id: saga.correlation_id().to_string(),
            occurred_at: at,
        }
    }
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_created(saga: &Saga, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaCreated(SagaEventData::of(saga, at))
    }

    pub fn saga_started(saga: &Saga, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaStarted(SagaEventData::of(saga, at))
    }

    pub fn saga_completed(saga: &Saga, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaCompleted(SagaEventData::of(saga, at))
    }

    pub fn saga_failed(saga: &Saga, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaFailed(SagaReasonData {
            saga: SagaEventData::of(saga, at),
            reason: reason.into(),
        })
    }

    pub fn saga_compensating(saga: &Saga, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaCompensating(SagaReasonData {
            saga: SagaEventData::of(saga, at),
            reason: reason.into(),
        })
    }

    pub fn saga_compensated(saga: &Saga, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaCompensated(SagaEventData::of(saga, at))
    }

    pub fn saga_compensation_failed(
        saga: &Saga,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        SagaEvent::SagaCompensationFailed(SagaReasonData {
            saga: SagaEventData::of(saga, at),
            reason: reason.into(),
        })
    }

    pub fn saga_cancelled(saga: &Saga, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaCancelled(SagaReasonData {
            saga: SagaEventData::of(saga, at),
            reason: reason.into(),
        })
    }

    pub fn saga_timed_out(saga: &Saga, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaTimedOut(SagaEventData::of(saga, at))
    }

    /// Builds the step event matching the step's current terminal status.
    ///
    /// Returns `None` for statuses that aren't announced.
    pub fn for_step(saga: &Saga, step: &SagaStep, at: DateTime<Utc>) -> Option<Self> {
        use crate::state::StepStatus;

        let data = StepEventData {
            saga: SagaEventData::of(saga, at),
            step_name: step.name.clone(),
            error: step.last_error.clone(),
        };
        match step.status() {
            StepStatus::Completed => Some(SagaEvent::StepCompleted(data)),
            StepStatus::Failed => Some(SagaEvent::StepFailed(data)),
            StepStatus::Skipped => Some(SagaEvent::StepSkipped(data)),
            StepStatus::Timeout => Some(SagaEvent::StepTimedOut(data)),
            StepStatus::Compensated => Some(SagaEvent::StepCompensated(data)),
            StepStatus::CompensationFailed => Some(SagaEvent::StepCompensationFailed(data)),
            StepStatus::Pending
            | StepStatus::Running
            | StepStatus::Retrying
            | StepStatus::Compensating => None,
        }
    }

    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaCreated(_) => "SagaCreated",
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
            SagaEvent::SagaCompensating(_) => "SagaCompensating",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaCompensationFailed(_) => "SagaCompensationFailed",
            SagaEvent::SagaCancelled(_) => "SagaCancelled",
            SagaEvent::SagaTimedOut(_) => "SagaTimedOut",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::StepSkipped(_) => "StepSkipped",
            SagaEvent::StepTimedOut(_) => "StepTimedOut",
            SagaEvent::StepCompensated(_) => "StepCompensated",
            SagaEvent::StepCompensationFailed(_) => "StepCompensationFailed",
        }
    }

    fn saga_data(&self) -> &SagaEventData {
        match self {
            SagaEvent::SagaCreated(data)
            | SagaEvent::SagaStarted(data)
            | SagaEvent::SagaCompleted(data)
            | SagaEvent::SagaCompensated(data)
            | SagaEvent::SagaTimedOut(data) => data,
            SagaEvent::SagaFailed(data)
            | SagaEvent::SagaCompensating(data)
            | SagaEvent::SagaCompensationFailed(data)
            | SagaEvent::SagaCancelled(data) => &data.saga,
            SagaEvent::StepCompleted(data)
            | SagaEvent::StepFailed(data)
            | SagaEvent::StepSkipped(data)
            | SagaEvent::StepTimedOut(data)
            | SagaEvent::StepCompensated(data)
            | SagaEvent::StepCompensationFailed(data) => &data.saga,
        }
    }

    /// The saga this event belongs to.
    pub fn saga_id(&self) -> SagaId {
        self.saga_data().saga_id
    }

    /// Correlation ID for cross-service tracing.
    pub fn correlation_id(&self) -> &str {
        &self.saga_data().correlation_id
    }

    /// Name of the step, for step-level events.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            SagaEvent::StepCompleted(data)
            | SagaEvent::StepFailed(data)
            | SagaEvent::StepSkipped(data)
            | SagaEvent::StepTimedOut(data)
            | SagaEvent::StepCompensated(data)
            | SagaEvent::StepCompensationFailed(data) => Some(&data.step_name),
            _ => None,
        }
    }
}
