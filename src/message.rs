//! NIP-01 frames exchanged with relays: JSON arrays `[type, ...args]`.

use serde_json::Value;

use crate::{error::Result, event::Event, filter::Filter};

/// Client to relay frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", event]`
    Event(Event),
    /// `["REQ", subscription_id, filter...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", subscription_id]`
    Close(String),
}

impl ClientMessage {
    pub fn as_json(&self) -> Result<String> {
        let frame = match self {
            ClientMessage::Event(ev) => {
                Value::Array(vec!["EVENT".into(), serde_json::to_value(ev)?])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec!["REQ".into(), subscription_id.clone().into()];
                arr.extend(filters.iter().map(|f| Value::Object(f.to_json())));
                Value::Array(arr)
            }
            ClientMessage::Close(sub) => Value::Array(vec!["CLOSE".into(), sub.clone().into()]),
        };
        Ok(frame.to_string())
    }
}

/// Relay to client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", subscription_id]`
    Eose(String),
    /// `["CLOSED", subscription_id, message]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["NOTICE", message]`
    Notice(String),
}

impl RelayMessage {
    /// Decode a text frame. Unparseable JSON, unknown types and wrong arity
    /// all return `None`; relays are noisy and that is not an error.
    pub fn from_json(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        let str_at = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first().and_then(|v| v.as_str())? {
            "EVENT" if arr.len() >= 3 => {
                let event = serde_json::from_value::<Event>(arr[2].clone()).ok()?;
                Some(RelayMessage::Event {
                    subscription_id: str_at(1)?,
                    event: Box::new(event),
                })
            }
            "OK" if arr.len() >= 3 => Some(RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: arr[2].as_bool()?,
                message: str_at(3).unwrap_or_default(),
            }),
            "EOSE" if arr.len() >= 2 => Some(RelayMessage::Eose(str_at(1)?)),
            "CLOSED" if arr.len() >= 2 => Some(RelayMessage::Closed {
                subscription_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            "NOTICE" if arr.len() >= 2 => Some(RelayMessage::Notice(str_at(1)?)),
            _ => None,
        }
    }
}
