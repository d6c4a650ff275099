//! Envelope codec for the tunnel wire protocol.
//!
//! Every application message on the tunnel is a single text frame holding a
//! JSON object:
//!
//! ```json
//! { "type": "<start|end|input|output|resize>", "sessionID": "<id>", "payload": ... }
//! ```
//!
//! Decoding is strict: unknown top-level fields, unknown types, an empty
//! `sessionID`, or a payload that does not match the per-type schema all
//! reject the envelope. Rejected envelopes are dropped by the caller with no
//! state change. Extra keys inside a `resize` payload are tolerated — only
//! the top level is closed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A validated tunnel message, typed per envelope kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Peer requests a new session. Inbound payload is ignored.
    Start { session_id: String },
    /// Session teardown. Outbound payload echoes the session ID; inbound
    /// payload is ignored.
    End { session_id: String },
    /// Keystrokes for a session's PTY. Inbound only.
    Input { session_id: String, data: String },
    /// Shell output for the peer. Outbound only.
    Output { session_id: String, data: String },
    /// Window size change. Inbound only.
    Resize {
        session_id: String,
        width: u16,
        height: u16,
    },
}

impl Envelope {
    /// The wire value of the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Start { .. } => "start",
            Envelope::End { .. } => "end",
            Envelope::Input { .. } => "input",
            Envelope::Output { .. } => "output",
            Envelope::Resize { .. } => "resize",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Envelope::Start { session_id }
            | Envelope::End { session_id }
            | Envelope::Input { session_id, .. }
            | Envelope::Output { session_id, .. }
            | Envelope::Resize { session_id, .. } => session_id,
        }
    }
}

/// Why an inbound message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message is not a JSON object.
    InvalidJson,
    /// The envelope or its payload does not match the schema.
    InvalidFormat,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::InvalidJson => write!(f, "data could not be parsed as JSON"),
            ProtocolError::InvalidFormat => write!(f, "object format invalid"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Raw wire shape. `deny_unknown_fields` closes the top level; `payload`
/// defaults to JSON null when absent so per-type validation decides.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(default)]
    payload: Value,
}

/// Outbound wire shape. Field order is the canonical
/// `{type, sessionID, payload}`.
#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "sessionID")]
    session_id: &'a str,
    payload: Value,
}

/// Decode and validate one inbound text message.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    if !value.is_object() {
        return Err(ProtocolError::InvalidJson);
    }

    let raw: WireEnvelope =
        serde_json::from_value(value).map_err(|_| ProtocolError::InvalidFormat)?;
    if raw.session_id.is_empty() {
        return Err(ProtocolError::InvalidFormat);
    }

    match raw.kind.as_str() {
        "start" => Ok(Envelope::Start {
            session_id: raw.session_id,
        }),
        "end" => Ok(Envelope::End {
            session_id: raw.session_id,
        }),
        "input" => {
            let Value::String(data) = raw.payload else {
                return Err(ProtocolError::InvalidFormat);
            };
            Ok(Envelope::Input {
                session_id: raw.session_id,
                data,
            })
        }
        "resize" => {
            let Some(payload) = raw.payload.as_object() else {
                return Err(ProtocolError::InvalidFormat);
            };
            let width = dimension(payload.get("width"))?;
            let height = dimension(payload.get("height"))?;
            Ok(Envelope::Resize {
                session_id: raw.session_id,
                width,
                height,
            })
        }
        // `output` travels agent-to-peer only; everything else is unknown.
        _ => Err(ProtocolError::InvalidFormat),
    }
}

/// Validate a resize dimension: present, numeric, integral, non-negative,
/// and within u16 range. `as_u64` is `None` for floats and negatives.
fn dimension(value: Option<&Value>) -> Result<u16, ProtocolError> {
    let raw = value
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::InvalidFormat)?;
    u16::try_from(raw).map_err(|_| ProtocolError::InvalidFormat)
}

/// Encode an envelope as its canonical wire string.
pub fn encode(envelope: &Envelope) -> String {
    let payload = match envelope {
        Envelope::Start { .. } => Value::String(String::new()),
        Envelope::End { session_id } => Value::String(session_id.clone()),
        Envelope::Input { data, .. } | Envelope::Output { data, .. } => {
            Value::String(data.clone())
        }
        Envelope::Resize { width, height, .. } => json!({ "width": width, "height": height }),
    };
    let wire = WireOut {
        kind: envelope.kind(),
        session_id: envelope.session_id(),
        payload,
    };
    serde_json::to_string(&wire).expect("envelope serializes")
}
