//! OCPP-J message framing
//!
//! OCPP 1.6-J carries RPC frames as JSON arrays over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Frame type tag, the first element of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_tag(tag: i64) -> Result<Self, OcppError> {
        match tag {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(OcppError::UnknownMessageType(other)),
        }
    }
}

/// RPC error codes of OCPP-J 1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Misspelled in the 1.6 schema, and on the wire with it.
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    /// Codes outside the 1.6 list degrade to `GenericError`
    fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

/// Actions the central system handles or sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // Charge point -> central system
    BootNotification,
    Heartbeat,
    StatusNotification,
    MeterValues,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,

    // Central system -> charge point
    TriggerMessage,
    GetConfiguration,
    ChangeConfiguration,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::BootNotification,
        Action::Heartbeat,
        Action::StatusNotification,
        Action::MeterValues,
        Action::DiagnosticsStatusNotification,
        Action::FirmwareStatusNotification,
        Action::TriggerMessage,
        Action::GetConfiguration,
        Action::ChangeConfiguration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::StatusNotification => "StatusNotification",
            Action::MeterValues => "MeterValues",
            Action::DiagnosticsStatusNotification => "DiagnosticsStatusNotification",
            Action::FirmwareStatusNotification => "FirmwareStatusNotification",
            Action::TriggerMessage => "TriggerMessage",
            Action::GetConfiguration => "GetConfiguration",
            Action::ChangeConfiguration => "ChangeConfiguration",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| OcppError::UnknownAction(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum OcppError {
    #[error("malformed JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("frame is not a valid OCPP-J array")]
    InvalidFormat,

    #[error("unsupported action {0}")]
    UnknownAction(String),

    #[error("unknown frame type {0}")]
    UnknownMessageType(i64),

    #[error("charge point answered {code:?}: {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("no response from charge point")]
    Timeout,

    #[error("connection to charge point closed")]
    ConnectionClosed,

    #[error("websocket: {0}")]
    WebSocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for OcppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        OcppError::WebSocket(e.to_string())
    }
}

/// Request frame
///
/// The action stays a plain string so that calls for actions we do not
/// handle can still be answered with a CALLERROR carrying their id.
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Outbound call with a fresh UUID v4 message id
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// Success response frame
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self { message_id, payload })
    }
}

/// Error response frame
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Error response with empty details
    pub fn new(message_id: String, error_code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            message_id,
            error_code,
            error_description: description.into(),
            error_details: json!({}),
        }
    }
}

/// Any OCPP-J frame
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Decode one text frame
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let frame: Vec<Value> = serde_json::from_slice(bytes)?;
        let (tag, fields) = frame.split_first().ok_or(OcppError::InvalidFormat)?;
        let message_type = MessageType::from_tag(tag.as_i64().ok_or(OcppError::InvalidFormat)?)?;

        let text = |value: &Value| {
            value
                .as_str()
                .map(str::to_string)
                .ok_or(OcppError::InvalidFormat)
        };

        let message = match (message_type, fields) {
            (MessageType::Call, [id, action, payload]) => OcppMessage::Call(Call {
                message_id: text(id)?,
                action: text(action)?,
                payload: payload.clone(),
            }),
            (MessageType::CallResult, [id, payload]) => OcppMessage::CallResult(CallResult {
                message_id: text(id)?,
                payload: payload.clone(),
            }),
            (MessageType::CallError, [id, code, description, details]) => {
                OcppMessage::CallError(CallError {
                    message_id: text(id)?,
                    error_code: ErrorCode::from_wire(&text(code)?),
                    error_description: description.as_str().unwrap_or_default().to_string(),
                    error_details: details.clone(),
                })
            }
            _ => return Err(OcppError::InvalidFormat),
        };
        Ok(message)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Encode as a JSON array frame
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let tag = self.message_type() as u8;
        let frame = match self {
            OcppMessage::Call(c) => json!([tag, c.message_id, c.action, c.payload]),
            OcppMessage::CallResult(r) => json!([tag, r.message_id, r.payload]),
            OcppMessage::CallError(e) => {
                let code = serde_json::to_value(e.error_code)?;
                json!([tag, e.message_id, code, e.error_description, e.error_details])
            }
        };
        Ok(serde_json::to_vec(&frame)?)
    }
}
