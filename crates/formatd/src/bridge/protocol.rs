//! Wire protocol types for editor-daemon communication.
//!
//! One JSON object per line, UTF-8, over the daemon's stdin/stdout:
//! - **Requests**: `format` (with `text` or `b64` payload), `ping`, `shutdown`
//! - **Replies**: `{"id":N,"ok":true,"text":...}` or `{"id":N,"ok":false,"error":...}`
//!
//! Decoding is lenient. A line that cannot be attributed to a request is
//! reported as [`Inbound::Unsolicited`] or [`ReplyError::Malformed`] and the
//! caller logs it; nothing here ever panics on daemon output.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Identifier correlating a request with its reply.
///
/// Allocated by the request table, strictly increasing, never reused while a
/// session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the format payload travels on the wire.
///
/// Daemon builds differ: some expect a JSON-escaped `text` field, others a
/// Base64 `b64` field. A session emits one encoding; replies are accepted in
/// either.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Text,
    B64,
}

impl PayloadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::B64 => "b64",
        }
    }
}

impl fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "b64" | "base64" => Ok(Self::B64),
            other => Err(format!("unknown payload encoding '{other}', expected 'text' or 'b64'")),
        }
    }
}

/// Messages from editor to daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    Format { id: RequestId, text: &'a str },
    /// Liveness probe; answered with `{"id":N,"ok":true}`.
    Ping { id: RequestId },
    /// Fire-and-forget. Carries no id and expects no routed reply.
    Shutdown,
}

impl Request<'_> {
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Format { id, .. } | Self::Ping { id } => Some(*id),
            Self::Shutdown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum Op {
    Format,
    Ping,
    Shutdown,
}

/// Field order here is the field order on the wire.
#[derive(Serialize)]
struct RequestEnvelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    op: Op,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    b64: Option<String>,
}

/// Raw reply shape. Every field is optional so that decoding never fails on
/// a missing field; meaning is assigned in [`WireCodec::decode`].
#[derive(Debug, Default, Deserialize)]
struct ReplyEnvelope {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    b64: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ms: Option<f64>,
}

/// Outcome carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// `ok: true`. Empty when the reply carried no payload (ping, or a daemon
    /// that omitted it).
    Ok(String),
    /// `ok: false` (or a payload that could not be decoded).
    Err(String),
}

/// A reply attributable to a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: RequestId,
    pub outcome: ReplyOutcome,
    /// Daemon-side processing time in milliseconds, when reported.
    pub elapsed_ms: Option<f64>,
}

/// A well-formed line that names no request (e.g. the daemon's answer to
/// `shutdown`, or an error about a line it could not parse).
#[derive(Debug, Clone, PartialEq)]
pub struct Unsolicited {
    pub ok: Option<bool>,
    pub error: Option<String>,
}

/// Anything decoded from one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply(Reply),
    Unsolicited(Unsolicited),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplyError {
    #[error("malformed reply: {reason}")]
    Malformed { reason: String },
}

/// Encodes requests to single lines and decodes reply lines.
///
/// Pure: no I/O. Line terminators are added by the framing layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireCodec {
    encoding: PayloadEncoding,
}

impl WireCodec {
    pub fn new(encoding: PayloadEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> PayloadEncoding {
        self.encoding
    }

    /// Encode a request as one line with no embedded newline.
    ///
    /// serde_json escapes `"`, `\`, and every control character (`\n`, `\r`,
    /// `\t` by name, the rest as `\u00XX`), so the result is always a single
    /// line regardless of the payload.
    pub fn encode(&self, request: &Request<'_>) -> Result<String, serde_json::Error> {
        let envelope = match request {
            Request::Format { id, text } => {
                let (text, b64) = match self.encoding {
                    PayloadEncoding::Text => (Some(*text), None),
                    PayloadEncoding::B64 => (None, Some(BASE64.encode(text.as_bytes()))),
                };
                RequestEnvelope {
                    id: Some(*id),
                    op: Op::Format,
                    text,
                    b64,
                }
            }
            Request::Ping { id } => RequestEnvelope {
                id: Some(*id),
                op: Op::Ping,
                text: None,
                b64: None,
            },
            Request::Shutdown => RequestEnvelope {
                id: None,
                op: Op::Shutdown,
                text: None,
                b64: None,
            },
        };
        serde_json::to_string(&envelope)
    }

    pub fn encode_format(&self, id: RequestId, text: &str) -> Result<String, serde_json::Error> {
        self.encode(&Request::Format { id, text })
    }

    /// The shutdown envelope, `{"op":"shutdown"}`.
    pub fn shutdown_line() -> &'static str {
        r#"{"op":"shutdown"}"#
    }

    /// Decode one reply line.
    ///
    /// Returns `Err(Malformed)` only for lines that are not JSON objects.
    /// A missing or non-integer `id` yields [`Inbound::Unsolicited`]. Payload
    /// decoding problems are attributed to the request when an id is present.
    pub fn decode(&self, line: &str) -> Result<Inbound, ReplyError> {
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).map_err(|e| ReplyError::Malformed {
                reason: e.to_string(),
            })?;
        // Derived Deserialize also accepts arrays positionally; only objects are envelopes.
        if !value.is_object() {
            return Err(ReplyError::Malformed {
                reason: "reply is not a JSON object".to_string(),
            });
        }
        let envelope: ReplyEnvelope =
            serde_json::from_value(value).map_err(|e| ReplyError::Malformed {
                reason: e.to_string(),
            })?;

        let Some(id) = envelope.id.as_ref().and_then(serde_json::Value::as_u64) else {
            return Ok(Inbound::Unsolicited(Unsolicited {
                ok: envelope.ok,
                error: envelope.error,
            }));
        };

        let outcome = if envelope.ok == Some(true) {
            match self.payload(envelope.text, envelope.b64) {
                Ok(text) => ReplyOutcome::Ok(text),
                Err(reason) => ReplyOutcome::Err(format!("invalid payload: {reason}")),
            }
        } else {
            ReplyOutcome::Err(
                envelope
                    .error
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        };

        Ok(Inbound::Reply(Reply {
            id: RequestId(id),
            outcome,
            elapsed_ms: envelope.ms,
        }))
    }

    /// Pick the payload field, preferring the one this codec emits.
    fn payload(&self, text: Option<String>, b64: Option<String>) -> Result<String, String> {
        let decode_b64 = |encoded: String| -> Result<String, String> {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| format!("bad base64: {e}"))?;
            String::from_utf8(bytes).map_err(|e| format!("payload is not UTF-8: {e}"))
        };

        match (self.encoding, text, b64) {
            (PayloadEncoding::B64, _, Some(encoded)) => decode_b64(encoded),
            (PayloadEncoding::Text, Some(text), _) => Ok(text),
            (_, Some(text), None) => Ok(text),
            (_, None, Some(encoded)) => decode_b64(encoded),
            (_, None, None) => Ok(String::new()),
        }
    }
}
