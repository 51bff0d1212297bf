//! Wire frame helpers for the realtime channel.
//!
//! Frames are JSON objects carrying at least a `method` field. Outbound
//! frames get a `time` timestamp and a `tempId` correlation id injected at
//! submit time; the serialized text is what the outbox retains and resends.
//! Inbound frames stay loosely typed — everything except acknowledgments is
//! forwarded to the dispatcher verbatim.

use serde_json::Value;
use thiserror::Error;

/// Method tag the server sets once it has received and processed a message.
pub const ACK_METHOD: &str = "acknowledged";
/// Field carrying the correlation id on outbound frames and acknowledgments.
pub const CORRELATION_FIELD: &str = "tempId";
/// Field carrying the client-side submit timestamp on outbound frames.
pub const TIME_FIELD: &str = "time";

/// Errors produced while building an outbound frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Outbound payloads must be JSON objects so the envelope fields can be
    /// injected.
    #[error("outbound payload must be a JSON object")]
    PayloadNotObject,

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes an outbound frame with `time` and `tempId` injected.
pub fn outbound_frame(
    payload: Value,
    correlation_id: &str,
    time_ms: u64,
) -> Result<String, FrameError> {
    let Value::Object(mut fields) = payload else {
        return Err(FrameError::PayloadNotObject);
    };
    fields.insert(TIME_FIELD.to_string(), Value::from(time_ms));
    fields.insert(
        CORRELATION_FIELD.to_string(),
        Value::from(correlation_id.to_string()),
    );
    Ok(serde_json::to_string(&Value::Object(fields))?)
}

/// Decodes an inbound text frame.
pub fn decode_frame(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(text)
}

/// Whether the frame is a server acknowledgment.
pub fn is_ack(frame: &Value) -> bool {
    frame.get("method").and_then(Value::as_str) == Some(ACK_METHOD)
}

/// Correlation id carried by an acknowledgment frame, if present.
pub fn ack_correlation_id(frame: &Value) -> Option<&str> {
    if !is_ack(frame) {
        return None;
    }
    frame.get(CORRELATION_FIELD).and_then(Value::as_str)
}
