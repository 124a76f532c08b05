//! Values that travel between components on the bus.
//!
//! Everything here is immutable once published; components share it behind
//! `Arc` and never mutate a value after emitting it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A raw message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A message ready to be published back to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Assignment the message answers.
    pub assignment_id: Uuid,
    pub correlation_id: Uuid,
    pub payload: Vec<u8>,
}

/// Where an assignment entered the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOrigin {
    /// Translated from an inbound broker message.
    Broker,
    /// Submitted through the local control surface.
    Local,
}

/// One unit of work directed at a named worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    /// Identifier of the message that requested the work; echoed back in the
    /// response so the originator can match it.
    pub correlation_id: Uuid,
    pub worker: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub origin: AssignmentOrigin,
    pub received_at: DateTime<Utc>,
}

impl Assignment {
    /// Create an assignment with a fresh local id.
    pub fn new(
        worker: impl Into<String>,
        correlation_id: Uuid,
        payload: serde_json::Value,
        metadata: HashMap<String, String>,
        origin: AssignmentOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            worker: worker.into(),
            payload,
            metadata,
            origin,
            received_at: Utc::now(),
        }
    }
}

/// Final outcome of an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkOutcome {
    Succeeded { result: serde_json::Value },
    Failed { reason: String },
}

impl WorkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Succeeded { .. })
    }
}

/// Published exactly once per assignment by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkCompletion {
    pub assignment_id: Uuid,
    pub correlation_id: Uuid,
    pub worker: String,
    pub metadata: HashMap<String, String>,
    pub outcome: WorkOutcome,
    pub completed_at: DateTime<Utc>,
}

impl WorkCompletion {
    pub fn new(assignment: &Assignment, outcome: WorkOutcome) -> Self {
        Self {
            assignment_id: assignment.id,
            correlation_id: assignment.correlation_id,
            worker: assignment.worker.clone(),
            metadata: assignment.metadata.clone(),
            outcome,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(assignment: &Assignment, reason: impl Into<String>) -> Self {
        Self::new(
            assignment,
            WorkOutcome::Failed {
                reason: reason.into(),
            },
        )
    }
}
