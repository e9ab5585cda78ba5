//! Outbound frames built from execution outcomes.
//!
//! Every function here is pure: the same inputs always produce the same bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::{EventType, Frame, NO_PARTITION, encode};
use crate::metadata::TimerRequest;
use crate::opcode::ResponseOpcode;

/// Frame a response payload that is not tied to a partition.
pub fn build_response(
    payload: impl Into<Bytes>,
    message_type: EventType,
    opcode: ResponseOpcode,
) -> Bytes {
    build_partition_response(NO_PARTITION, payload, message_type, opcode)
}

pub fn build_partition_response(
    partition: i16,
    payload: impl Into<Bytes>,
    message_type: EventType,
    opcode: ResponseOpcode,
) -> Bytes {
    encode(&Frame::new(
        message_type,
        opcode as u8,
        partition,
        Bytes::new(),
        payload,
    ))
}

/// Result of an Init or Load request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub code: u8,
    pub message: String,
}

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOutcome {
    pub id: String,
    pub partition: i16,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A handler's request to create a timer, forwarded to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTimer {
    pub partition: i16,
    #[serde(flatten)]
    pub timer: TimerRequest,
}

pub fn ack_response(code: u8, message: impl Into<String>) -> Bytes {
    let ack = AckPayload {
        code,
        message: message.into(),
    };
    build_response(to_json(&ack), EventType::Control, ResponseOpcode::Ack)
}

pub fn outcome_response(message_type: EventType, outcome: &EventOutcome) -> Bytes {
    let opcode = if outcome.error.is_some() {
        ResponseOpcode::EventFailure
    } else {
        ResponseOpcode::EventSuccess
    };
    build_partition_response(outcome.partition, to_json(outcome), message_type, opcode)
}

pub fn create_timer_response(request: &CreateTimer) -> Bytes {
    build_partition_response(
        request.partition,
        to_json(request),
        EventType::Timer,
        ResponseOpcode::CreateTimer,
    )
}

pub fn stats_response(stats: &serde_json::Value) -> Bytes {
    build_response(to_json(stats), EventType::Control, ResponseOpcode::Stats)
}

pub fn checkpoint_response(partition: i16, seq: Option<u64>) -> Bytes {
    let body = serde_json::json!({ "vb": partition, "seq": seq });
    build_partition_response(
        partition,
        to_json(&body),
        EventType::Control,
        ResponseOpcode::Checkpoint,
    )
}

fn to_json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;

    #[test]
    fn ack_is_a_control_frame() {
        let frame = decode(&ack_response(0, "ok")).expect("decode");
        assert_eq!(frame.event, EventType::Control);
        assert_eq!(frame.opcode, ResponseOpcode::Ack as u8);
        assert_eq!(frame.partition, NO_PARTITION);
        let ack: AckPayload = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(ack.code, 0);
        assert_eq!(ack.message, "ok");
    }

    #[test]
    fn failed_outcome_uses_failure_opcode() {
        let outcome = EventOutcome {
            id: "doc".into(),
            partition: 7,
            seq: 3,
            error: Some("boom".into()),
        };
        let frame = decode(&outcome_response(EventType::Deletion, &outcome)).expect("decode");
        assert_eq!(frame.opcode, ResponseOpcode::EventFailure as u8);
        assert_eq!(frame.partition, 7);
        assert_eq!(frame.event, EventType::Deletion);
    }

    #[test]
    fn create_timer_flattens_request() {
        let request = CreateTimer {
            partition: 12,
            timer: TimerRequest {
                callback: "expire".into(),
                due: 99,
                reference: "ref".into(),
                context: serde_json::json!({"k": 1}),
            },
        };
        let frame = decode(&create_timer_response(&request)).expect("decode");
        let body: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(body["callback"], "expire");
        assert_eq!(body["partition"], 12);
        assert_eq!(body["context"]["k"], 1);
    }

    #[test]
    fn build_response_is_deterministic() {
        let a = build_response(&b"x"[..], EventType::Control, ResponseOpcode::Stats);
        let b = build_response(&b"x"[..], EventType::Control, ResponseOpcode::Stats);
        assert_eq!(a, b);
    }
}
