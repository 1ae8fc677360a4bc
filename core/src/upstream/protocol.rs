//! Relay wire framing: JSON arrays tagged by their first element

use crate::event::{Event, Filter};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownMessage(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A message sent from the node to a relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", event]`
    Event(Event),
    /// `["REQ", subscription_id, filter...]`
    Req { id: String, filters: Vec<Filter> },
    /// `["CLOSE", subscription_id]`
    Close(String),
}

/// A message received from a relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event { subscription: String, event: Event },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", subscription_id]`
    Eose(String),
    /// `["NOTICE", message]`
    Notice(String),
    /// `["CLOSED", subscription_id, message]`
    Closed { subscription: String, message: String },
}

fn frame(text: &str) -> Result<(String, Vec<Value>), ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let mut items = match value {
        Value::Array(items) => items,
        _ => return Err(ProtocolError::Malformed("expected a JSON array".to_string())),
    };
    if items.is_empty() {
        return Err(ProtocolError::Malformed("empty frame".to_string()));
    }
    match items.remove(0) {
        Value::String(tag) => Ok((tag, items)),
        _ => Err(ProtocolError::Malformed("frame tag is not a string".to_string())),
    }
}

fn string_at(items: &[Value], index: usize) -> Result<String, ProtocolError> {
    items
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Malformed(format!("expected string at position {}", index + 1)))
}

impl ClientMessage {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close(_) => "CLOSE",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req { id, filters } => {
                let mut items = vec![json!("REQ"), json!(id)];
                for filter in filters {
                    items.push(serde_json::to_value(filter)?);
                }
                Value::Array(items)
            }
            ClientMessage::Close(id) => json!(["CLOSE", id]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let (tag, items) = frame(text)?;
        match tag.as_str() {
            "EVENT" => {
                let event = items
                    .into_iter()
                    .next()
                    .ok_or_else(|| ProtocolError::Malformed("EVENT without event".to_string()))?;
                Ok(ClientMessage::Event(serde_json::from_value(event)?))
            }
            "REQ" => {
                let id = string_at(&items, 0)?;
                let filters = items
                    .into_iter()
                    .skip(1)
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req { id, filters })
            }
            "CLOSE" => Ok(ClientMessage::Close(string_at(&items, 0)?)),
            other => Err(ProtocolError::UnknownMessage(other.to_string())),
        }
    }
}

impl RelayMessage {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::Event { .. } => "EVENT",
            RelayMessage::Ok { .. } => "OK",
            RelayMessage::Eose(_) => "EOSE",
            RelayMessage::Notice(_) => "NOTICE",
            RelayMessage::Closed { .. } => "CLOSED",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            RelayMessage::Event {
                subscription,
                event,
            } => json!(["EVENT", subscription, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Eose(id) => json!(["EOSE", id]),
            RelayMessage::Notice(message) => json!(["NOTICE", message]),
            RelayMessage::Closed {
                subscription,
                message,
            } => json!(["CLOSED", subscription, message]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let (tag, items) = frame(text)?;
        match tag.as_str() {
            "EVENT" => {
                let subscription = string_at(&items, 0)?;
                let event = items
                    .into_iter()
                    .nth(1)
                    .ok_or_else(|| ProtocolError::Malformed("EVENT without event".to_string()))?;
                Ok(RelayMessage::Event {
                    subscription,
                    event: serde_json::from_value(event)?,
                })
            }
            "OK" => Ok(RelayMessage::Ok {
                event_id: string_at(&items, 0)?,
                accepted: items.get(1).and_then(Value::as_bool).ok_or_else(|| {
                    ProtocolError::Malformed("OK without acceptance flag".to_string())
                })?,
                message: items
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "EOSE" => Ok(RelayMessage::Eose(string_at(&items, 0)?)),
            "NOTICE" => Ok(RelayMessage::Notice(string_at(&items, 0)?)),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription: string_at(&items, 0)?,
                message: items
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(ProtocolError::UnknownMessage(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "abc".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1_700_000_000,
            kind: 9,
            tags: vec![vec!["h".to_string(), "general".to_string()]],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_req_frame_layout() {
        let msg = ClientMessage::Req {
            id: "channel-general-sync".to_string(),
            filters: vec![Filter::new()
                .kinds([9, 10, 11, 12])
                .tag("h", vec!["general".to_string()])],
        };

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!(["REQ", "channel-general-sync", {"kinds": [9, 10, 11, 12], "#h": ["general"]}])
        );
        assert_eq!(msg.message_type(), "REQ");
    }

    #[test]
    fn test_parse_relay_event() {
        let text = serde_json::to_string(&json!(["EVENT", "metadata-sync", sample_event()])).unwrap();
        match RelayMessage::from_json(&text).unwrap() {
            RelayMessage::Event {
                subscription,
                event,
            } => {
                assert_eq!(subscription, "metadata-sync");
                assert_eq!(event, sample_event());
            }
            other => panic!("Wrong message type: {}", other.message_type()),
        }
    }

    #[test]
    fn test_parse_ok_and_closed() {
        let ok = RelayMessage::from_json(r#"["OK","abc",false,"blocked: spam"]"#).unwrap();
        assert_eq!(
            ok,
            RelayMessage::Ok {
                event_id: "abc".to_string(),
                accepted: false,
                message: "blocked: spam".to_string(),
            }
        );

        let closed = RelayMessage::from_json(r#"["CLOSED","sub"]"#).unwrap();
        assert_eq!(
            closed,
            RelayMessage::Closed {
                subscription: "sub".to_string(),
                message: String::new(),
            }
        );
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(matches!(
            RelayMessage::from_json(r#"{"not":"array"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            RelayMessage::from_json("[]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["AUTH","challenge"]"#),
            Err(ProtocolError::UnknownMessage(tag)) if tag == "AUTH"
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["OK","abc"]"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_client_event_frame_parses_back() {
        let msg = ClientMessage::Event(sample_event());
        let parsed = ClientMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }
}
