//! JSON envelopes exchanged with the broker.
//!
//! Every envelope is an object tagged by `type`. Inbound work arrives as a
//! `data` envelope whose `directive` names the target worker; results leave
//! as `data` envelopes whose `response_to` echoes the request's
//! `message_id`. The handshake is a `connection-status` envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MalformedPayloadError;
use crate::facts::CanonicalFacts;
use crate::model::{
    Assignment, AssignmentOrigin, InboundMessage, OutboundMessage, WorkCompletion, WorkOutcome,
};

/// Envelope format version written by this daemon.
pub const ENVELOPE_VERSION: u32 = 1;

/// Metadata key carrying the outcome of a returned assignment.
pub const STATUS_KEY: &str = "status";
/// Metadata key carrying the failure reason of a returned assignment.
pub const ERROR_KEY: &str = "error";

/// A `data` envelope, in either direction.
///
/// Only `message_id` is required on input. A missing `sent` is stamped with
/// the receive time, but a `sent` that is present and not an RFC 3339
/// timestamp makes the whole message malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<Uuid>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub sent: DateTime<Utc>,
    #[serde(default)]
    pub directive: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus<'a> {
    pub message_id: Uuid,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub state: &'static str,
    pub facts: &'a CanonicalFacts,
}

/// Envelopes this daemon writes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope<'a> {
    Data(DataMessage),
    ConnectionStatus(ConnectionStatus<'a>),
}

/// Turn an inbound broker message into an assignment.
pub fn parse_inbound(msg: &InboundMessage) -> Result<Assignment, MalformedPayloadError> {
    let json_error = |source: serde_json::Error| MalformedPayloadError::Json {
        topic: msg.topic.clone(),
        source,
    };

    let value: serde_json::Value = serde_json::from_slice(&msg.payload).map_err(json_error)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if kind != "data" {
        return Err(MalformedPayloadError::UnsupportedType {
            topic: msg.topic.clone(),
            kind,
        });
    }

    let data: DataMessage = serde_json::from_value(value).map_err(json_error)?;
    let worker = data.directive.trim();
    if worker.is_empty() {
        return Err(MalformedPayloadError::MissingDirective {
            topic: msg.topic.clone(),
            message_id: data.message_id,
        });
    }

    Ok(Assignment::new(
        worker,
        data.message_id,
        data.content,
        data.metadata,
        AssignmentOrigin::Broker,
    ))
}

/// Build the outbound envelope answering a completed assignment.
pub fn translate_completion(
    completion: &WorkCompletion,
) -> Result<OutboundMessage, serde_json::Error> {
    let mut metadata = completion.metadata.clone();
    let content = match &completion.outcome {
        WorkOutcome::Succeeded { result } => {
            metadata.insert(STATUS_KEY.to_string(), "success".to_string());
            result.clone()
        }
        WorkOutcome::Failed { reason } => {
            metadata.insert(STATUS_KEY.to_string(), "failed".to_string());
            metadata.insert(ERROR_KEY.to_string(), reason.clone());
            serde_json::Value::Null
        }
    };

    let envelope = Envelope::Data(DataMessage {
        message_id: Uuid::new_v4(),
        response_to: Some(completion.correlation_id),
        version: ENVELOPE_VERSION,
        sent: Utc::now(),
        directive: completion.worker.clone(),
        metadata,
        content,
    });

    Ok(OutboundMessage {
        assignment_id: completion.assignment_id,
        correlation_id: completion.correlation_id,
        payload: serde_json::to_vec(&envelope)?,
    })
}

/// The presence announcement published after connecting.
pub fn handshake_envelope(facts: &CanonicalFacts) -> Envelope<'_> {
    Envelope::ConnectionStatus(ConnectionStatus {
        message_id: Uuid::new_v4(),
        version: ENVELOPE_VERSION,
        sent: Utc::now(),
        state: "online",
        facts,
    })
}
