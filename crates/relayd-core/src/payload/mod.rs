//! Translation between broker payloads and local assignments.

mod envelope;

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::bus::{Bus, Event, Subscription};
use crate::model::{InboundMessage, WorkCompletion};
use crate::recent::RecentIds;

pub use envelope::{
    ConnectionStatus, DataMessage, ENVELOPE_VERSION, ERROR_KEY, Envelope, STATUS_KEY,
    handshake_envelope, parse_inbound, translate_completion,
};

/// How many returned assignment ids are remembered to suppress duplicates.
const RETURNED_MEMORY: usize = 4096;

pub struct PayloadProcessor {
    bus: Bus,
    returned: Mutex<RecentIds>,
}

impl std::fmt::Debug for PayloadProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadProcessor").finish_non_exhaustive()
    }
}

impl PayloadProcessor {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            returned: Mutex::new(RecentIds::new(RETURNED_MEMORY)),
        }
    }

    /// Turn every inbound message into an `assignment-create` event.
    /// Malformed messages are logged and dropped.
    pub async fn handle_message_recv_signal(&self, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            if let Event::MessageRecv(msg) = event {
                self.process_inbound(&msg).await;
            }
        }
        debug!("message-recv subscription closed");
    }

    async fn process_inbound(&self, msg: &InboundMessage) {
        match parse_inbound(msg) {
            Ok(assignment) => {
                info!(
                    assignment_id = %assignment.id,
                    correlation_id = %assignment.correlation_id,
                    worker = %assignment.worker,
                    "assignment created"
                );
                self.bus
                    .emit(Event::AssignmentCreate(Arc::new(assignment)))
                    .await;
            }
            Err(e) => warn!(error = %e, "dropping malformed payload"),
        }
    }

    /// Translate every completion into an `assignment-return` event, at
    /// most once per assignment.
    pub async fn handle_work_complete_signal(&self, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            if let Event::WorkComplete(completion) = event {
                self.process_completion(&completion).await;
            }
        }
        debug!("work-complete subscription closed");
    }

    async fn process_completion(&self, completion: &WorkCompletion) {
        let first = self
            .returned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(completion.assignment_id);
        if !first {
            debug!(assignment_id = %completion.assignment_id, "duplicate completion ignored");
            return;
        }

        match translate_completion(completion) {
            Ok(outbound) => {
                self.bus
                    .emit(Event::AssignmentReturn(Arc::new(outbound)))
                    .await;
            }
            Err(e) => warn!(
                assignment_id = %completion.assignment_id,
                error = %e,
                "cannot encode result"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use uuid::Uuid;

    use super::*;
    use crate::bus::Signal;
    use crate::model::{Assignment, AssignmentOrigin, WorkOutcome};

    #[tokio::test]
    async fn duplicate_completion_returns_once() {
        let bus = Bus::new();
        let mut out = bus.connect(Signal::AssignmentReturn);
        let processor = PayloadProcessor::new(bus.clone());

        let assignment = Assignment::new(
            "echo",
            Uuid::new_v4(),
            serde_json::Value::Null,
            HashMap::new(),
            AssignmentOrigin::Broker,
        );
        let done = WorkCompletion::new(
            &assignment,
            WorkOutcome::Succeeded {
                result: serde_json::json!(1),
            },
        );
        processor.process_completion(&done).await;
        processor.process_completion(&done).await;

        match out.recv().await.unwrap() {
            Event::AssignmentReturn(msg) => assert_eq!(msg.assignment_id, assignment.id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(out.try_recv().is_none());
    }

    #[tokio::test]
    async fn malformed_inbound_emits_nothing() {
        let bus = Bus::new();
        let mut created = bus.connect(Signal::AssignmentCreate);
        let processor = PayloadProcessor::new(bus.clone());

        processor
            .process_inbound(&InboundMessage {
                topic: "t".to_string(),
                payload: b"garbage".to_vec(),
            })
            .await;
        assert!(created.try_recv().is_none());
    }
}
