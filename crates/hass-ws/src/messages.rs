//! Wire message types for the hub WebSocket API
//!
//! Each frame is one complete text message carrying one JSON object,
//! discriminated by its `type` field. Incoming frames decode into a closed
//! variant set; outgoing frames are built as JSON objects so the assigned
//! correlation id can be merged in at send time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, ClientResult};

// =============================================================================
// Incoming Messages
// =============================================================================

/// Incoming WebSocket message from the hub
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    /// First frame on every connection; the client must answer with `auth`
    AuthRequired { ha_version: String },
    /// Authentication accepted; carries the negotiated hub version
    AuthOk { ha_version: String },
    /// Authentication rejected; terminal for this connection
    AuthInvalid {
        #[serde(default)]
        message: String,
    },
    /// Response to an identifiable command
    Result(ResultMessage),
    /// Push event produced by a server subscription
    Event(EventMessage),
    /// Response to a `ping`
    Pong { id: u64 },
}

/// Response to an identifiable command
#[derive(Debug, Clone, Deserialize)]
pub struct ResultMessage {
    pub id: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// Push event frame, tagged with the subscription id that produced it
///
/// The event payload stays opaque here; the dispatch loop decodes it.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub id: u64,
    pub event: Value,
}

// =============================================================================
// Error Codes
// =============================================================================

/// Structured rejection information from a `result` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Error codes the hub attaches to failed commands
///
/// Codes outside the known set are preserved verbatim so callers can still
/// inspect them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The caller lacks permission for the command
    Unauthorized,
    /// The command exceeded the hub-side timeout
    Timeout,
    /// The message failed hub-side schema validation
    InvalidFormat,
    /// A non-increasing message id was supplied
    IdReuse,
    /// A hub-internal error occurred while handling the command
    HomeAssistantError,
    /// The command exists but the action is not supported
    NotSupported,
    /// The command is not recognized by the hub
    UnknownCommand,
    /// The requested item cannot be found
    NotFound,
    /// Unexpected hub-side error
    UnknownError,
    /// Any code this client does not classify
    #[serde(untagged)]
    Unknown(String),
}

// =============================================================================
// Outgoing Messages
// =============================================================================

/// Outgoing WebSocket message to the hub
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    /// Handshake reply carrying the access token; the only frame without an id
    Auth { access_token: String },
    /// Open a server subscription for one event type, or all with `None`
    SubscribeEvents { event_type: Option<String> },
    /// Close the server subscription created under the given id
    UnsubscribeEvents { subscription: u64 },
    /// Liveness probe answered with `pong`
    Ping,
    /// Generic identifiable command with caller-supplied payload
    Command(CommandMessage),
}

impl OutgoingMessage {
    /// Whether this message carries a correlation id on the wire
    pub fn is_identifiable(&self) -> bool {
        !matches!(self, OutgoingMessage::Auth { .. })
    }

    /// Serialize to a single wire frame, merging in the assigned id
    pub fn to_frame(&self, id: Option<u64>) -> ClientResult<String> {
        let mut object = serde_json::Map::new();
        match self {
            OutgoingMessage::Auth { access_token } => {
                object.insert("type".into(), Value::from("auth"));
                object.insert("access_token".into(), Value::from(access_token.clone()));
            }
            OutgoingMessage::SubscribeEvents { event_type } => {
                object.insert("type".into(), Value::from("subscribe_events"));
                if let Some(event_type) = event_type {
                    object.insert("event_type".into(), Value::from(event_type.clone()));
                }
            }
            OutgoingMessage::UnsubscribeEvents { subscription } => {
                object.insert("type".into(), Value::from("unsubscribe_events"));
                object.insert("subscription".into(), Value::from(*subscription));
            }
            OutgoingMessage::Ping => {
                object.insert("type".into(), Value::from("ping"));
            }
            OutgoingMessage::Command(command) => {
                object.insert("type".into(), Value::from(command.command_type.clone()));
                if let Some(Value::Object(data)) = &command.data {
                    for (key, value) in data {
                        object.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        if let Some(id) = id {
            object.insert("id".into(), Value::from(id));
        }
        serde_json::to_string(&Value::Object(object)).map_err(ClientError::from)
    }
}

/// A generic identifiable command
///
/// The payload is merged into the frame next to `type` and `id`, so callers
/// build exactly the object the hub documents for their command.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    command_type: String,
    data: Option<Value>,
}

impl CommandMessage {
    /// Create a command with no payload besides its type
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            data: None,
        }
    }

    /// Create a command with a payload that serializes to a JSON object
    pub fn with_data(
        command_type: impl Into<String>,
        data: &impl Serialize,
    ) -> ClientResult<Self> {
        let data = serde_json::to_value(data)?;
        if !data.is_object() {
            return Err(ClientError::Configuration(
                "command payload must serialize to a JSON object".into(),
            ));
        }
        Ok(Self {
            command_type: command_type.into(),
            data: Some(data),
        })
    }

    /// The wire `type` of this command
    pub fn command_type(&self) -> &str {
        &self.command_type
    }
}

impl From<CommandMessage> for OutgoingMessage {
    fn from(command: CommandMessage) -> Self {
        OutgoingMessage::Command(command)
    }
}

// =============================================================================
// Command Results
// =============================================================================

/// Outcome of an identifiable command exchange
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the hub reported success
    pub success: bool,
    /// Payload returned on success, if any
    pub result: Option<Value>,
    /// Structured rejection on failure, if any
    pub error: Option<ErrorInfo>,
}

impl CommandResult {
    /// A bare successful result, used for `pong` responses
    pub(crate) fn succeeded() -> Self {
        Self {
            success: true,
            result: None,
            error: None,
        }
    }

    /// Deserialize the success payload to the specified type
    pub fn deserialize_result<T: serde::de::DeserializeOwned>(&self) -> ClientResult<T> {
        let value = self.result.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(ClientError::from)
    }
}

impl From<ResultMessage> for CommandResult {
    fn from(message: ResultMessage) -> Self {
        Self {
            success: message.success,
            result: message.result,
            error: message.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_result_frame() {
        let text = r#"{"id": 3, "type": "result", "success": true, "result": {"ok": 1}}"#;
        let msg: IncomingMessage = serde_json::from_str(text).unwrap();
        match msg {
            IncomingMessage::Result(result) => {
                assert_eq!(result.id, 3);
                assert!(result.success);
                assert_eq!(result.result.unwrap()["ok"], 1);
                assert!(result.error.is_none());
            }
            other => panic!("expected result frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_result_frame() {
        let text = r#"{
            "id": 7, "type": "result", "success": false,
            "error": {"code": "unauthorized", "message": "nope"}
        }"#;
        let msg: IncomingMessage = serde_json::from_str(text).unwrap();
        match msg {
            IncomingMessage::Result(result) => {
                let error = result.error.unwrap();
                assert_eq!(error.code, ErrorCode::Unauthorized);
                assert_eq!(error.message, "nope");
            }
            other => panic!("expected result frame, got {other:?}"),
        }
    }

    #[test]
    fn test_unclassified_error_code_is_preserved() {
        let info: ErrorInfo =
            serde_json::from_value(json!({"code": "quota_exceeded", "message": "m"})).unwrap();
        assert_eq!(info.code, ErrorCode::Unknown("quota_exceeded".into()));
    }

    #[test]
    fn test_decode_event_and_pong_frames() {
        let event: IncomingMessage = serde_json::from_str(
            r#"{"id": 2, "type": "event", "event": {"event_type": "state_changed"}}"#,
        )
        .unwrap();
        assert!(matches!(event, IncomingMessage::Event(e) if e.id == 2));

        let pong: IncomingMessage =
            serde_json::from_str(r#"{"id": 5, "type": "pong"}"#).unwrap();
        assert!(matches!(pong, IncomingMessage::Pong { id: 5 }));
    }

    #[test]
    fn test_auth_frame_has_no_id() {
        let msg = OutgoingMessage::Auth {
            access_token: "token".into(),
        };
        assert!(!msg.is_identifiable());

        let frame: Value = serde_json::from_str(&msg.to_frame(None).unwrap()).unwrap();
        assert_eq!(frame["type"], "auth");
        assert_eq!(frame["access_token"], "token");
        assert!(frame.get("id").is_none());
    }

    #[test]
    fn test_subscribe_frame_omits_wildcard_event_type() {
        let all = OutgoingMessage::SubscribeEvents { event_type: None };
        let frame: Value = serde_json::from_str(&all.to_frame(Some(1)).unwrap()).unwrap();
        assert_eq!(frame["type"], "subscribe_events");
        assert_eq!(frame["id"], 1);
        assert!(frame.get("event_type").is_none());

        let typed = OutgoingMessage::SubscribeEvents {
            event_type: Some("state_changed".into()),
        };
        let frame: Value = serde_json::from_str(&typed.to_frame(Some(2)).unwrap()).unwrap();
        assert_eq!(frame["event_type"], "state_changed");
    }

    #[test]
    fn test_command_payload_is_merged_into_frame() {
        let command = CommandMessage::with_data(
            "call_service",
            &json!({"domain": "light", "service": "turn_on"}),
        )
        .unwrap();
        let frame: Value = serde_json::from_str(
            &OutgoingMessage::from(command).to_frame(Some(9)).unwrap(),
        )
        .unwrap();

        assert_eq!(frame["type"], "call_service");
        assert_eq!(frame["id"], 9);
        assert_eq!(frame["domain"], "light");
        assert_eq!(frame["service"], "turn_on");
    }

    #[test]
    fn test_command_payload_must_be_object() {
        let err = CommandMessage::with_data("ping", &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }
}
