//! Control wire framing
//!
//! Inbound:  `["CONTROL", token, action, payload]`
//! Outbound: `["CONTROL", {"type": ..., "data": ...}]`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CONTROL_TAG: &str = "CONTROL";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed control frame: {0}")]
    Malformed(String),
}

/// An operator request
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub auth_token: String,
    pub action: String,
    pub payload: Value,
}

impl ControlMessage {
    pub fn new(auth_token: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            auth_token: auth_token.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn to_frame(&self) -> String {
        Value::Array(vec![
            Value::String(CONTROL_TAG.to_string()),
            Value::String(self.auth_token.clone()),
            Value::String(self.action.clone()),
            self.payload.clone(),
        ])
        .to_string()
    }
}

/// Parse an inbound frame. `Ok(None)` for frames not tagged `CONTROL`.
pub fn parse_frame(text: &str) -> Result<Option<ControlMessage>, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let items = value
        .as_array()
        .ok_or_else(|| FrameError::Malformed("expected an array".to_string()))?;

    if items.first().and_then(Value::as_str) != Some(CONTROL_TAG) {
        return Ok(None);
    }

    let auth_token = items
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let action = items
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| FrameError::Malformed("missing action".to_string()))?
        .to_string();
    let payload = items.get(3).cloned().unwrap_or(Value::Null);

    Ok(Some(ControlMessage {
        auth_token,
        action,
        payload,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastType {
    #[serde(rename = "config/set")]
    ConfigSet,
    #[serde(rename = "status/set")]
    StatusSet,
    #[serde(rename = "logs/remote")]
    LogsRemote,
}

/// A payload pushed to authorized operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlBroadcast {
    #[serde(rename = "type")]
    pub kind: BroadcastType,
    pub data: Value,
}

impl ControlBroadcast {
    pub fn new(kind: BroadcastType, data: Value) -> Self {
        Self { kind, data }
    }

    pub fn to_frame(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(&(CONTROL_TAG, self))?)
    }

    pub fn from_frame(text: &str) -> Result<Self, FrameError> {
        let (tag, broadcast): (String, ControlBroadcast) = serde_json::from_str(text)?;
        if tag != CONTROL_TAG {
            return Err(FrameError::Malformed(format!("unexpected tag {}", tag)));
        }
        Ok(broadcast)
    }
}
