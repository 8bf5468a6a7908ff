//! Text frames exchanged with the remote card client.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Decoding
//! maps the discriminator to exactly one of the five message kinds and
//! fails on anything else, so an unknown kind is never mistaken for a
//! malformed known one.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definitions::scenario::Step;

const TYPE_FIELD: &str = "type";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a valid message: {0}")]
    Malformed(String),
    #[error("frame has no '{TYPE_FIELD}' discriminator")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMessage {
    #[serde(default)]
    pub version: String,
    pub card_connection_type: String,
    pub client_session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStep {
    pub command_apdu: String,
    pub expected_status_words: Vec<String>,
}

impl From<&Step> for ScenarioStep {
    fn from(step: &Step) -> Self {
        Self {
            command_apdu: step.command_hex.clone(),
            expected_status_words: step.accepted_status_words.clone(),
        }
    }
}

/// The batch of commands the client has to run against its card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardScenarioMessage {
    pub version: String,
    pub client_session_id: String,
    pub sequence_counter: u64,
    /// Allotted time for the answer, in milliseconds.
    pub time_span: u64,
    pub steps: Vec<ScenarioStep>,
}

/// Raw card responses as hex, one per dispatched step, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioResponseMessage {
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMessage {
    pub token: String,
    pub pn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub error_code: String,
    pub error_detail: String,
}

impl ErrorMessage {
    pub fn new(error_code: impl Into<String>, error_detail: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            error_detail: error_detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Message {
    Start(StartMessage),
    StandardScenario(StandardScenarioMessage),
    ScenarioResponse(ScenarioResponseMessage),
    Token(TokenMessage),
    Error(ErrorMessage),
}

impl Message {
    pub const fn kind(&self) -> &'static str {
        match self {
            Message::Start(_) => "Start",
            Message::StandardScenario(_) => "StandardScenario",
            Message::ScenarioResponse(_) => "ScenarioResponse",
            Message::Token(_) => "Token",
            Message::Error(_) => "Error",
        }
    }

    pub fn from_json(frame: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kind = match value.get(TYPE_FIELD) {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => {
                return Err(DecodeError::Malformed(format!(
                    "'{TYPE_FIELD}' must be a string, got {other}"
                )))
            }
            None => return Err(DecodeError::MissingType),
        };

        match kind.as_str() {
            "Start" => decode(value).map(Message::Start),
            "StandardScenario" => decode(value).map(Message::StandardScenario),
            "ScenarioResponse" => decode(value).map(Message::ScenarioResponse),
            "Token" => decode(value).map(Message::Token),
            "Error" => decode(value).map(Message::Error),
            _ => Err(DecodeError::UnknownType(kind)),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}
