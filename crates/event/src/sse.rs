//! Server-sent-events framing.
//!
//! Each frame is `event: <type>\ndata: <json>\n\n` where the JSON is the
//! full [`ArchflowEvent`] envelope. The parser exists for round-trip tests
//! and for clients embedded in the same process.

use crate::envelope::ArchflowEvent;

/// Error returned by [`parse_frame`].
#[derive(Debug, thiserror::Error)]
pub enum SseError {
    /// The frame is missing an `event:` or `data:` line.
    #[error("malformed SSE frame")]
    Malformed,
    /// The data line is not a valid event envelope.
    #[error("invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an event as one SSE frame.
///
/// # Errors
///
/// Returns [`SseError::Json`] if the envelope cannot be serialized, which
/// only happens for non-string map keys smuggled into `data`.
pub fn to_frame(event: &ArchflowEvent) -> Result<String, SseError> {
    let json = serde_json::to_string(event)?;
    Ok(format!("event: {}\ndata: {}\n\n", event.event_type, json))
}

/// Parse one SSE frame back into an event envelope.
///
/// # Errors
///
/// Returns [`SseError::Malformed`] when the `event:`/`data:` lines are
/// absent, or [`SseError::Json`] when the payload does not deserialize.
pub fn parse_frame(frame: &str) -> Result<ArchflowEvent, SseError> {
    let mut data = None;
    let mut saw_event_line = false;
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            saw_event_line = !rest.trim().is_empty();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data = Some(rest.trim());
        }
    }
    let data = data.filter(|_| saw_event_line).ok_or(SseError::Malformed)?;
    Ok(serde_json::from_str(data)?)
}
