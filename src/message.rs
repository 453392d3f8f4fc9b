use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Protocol event names
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";
    pub const INTERNAL_PREFIX: &str = "pusher_internal:";
    pub const CLIENT_PREFIX: &str = "client-";
}

/// Pusher protocol envelope: `{event, data, channel?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PusherMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl PusherMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The `data` field as the string handed to listeners.
    ///
    /// The server usually sends `data` as a JSON-encoded string; in that case the
    /// string itself is returned. Any other JSON value is re-serialized compactly.
    pub fn data_string(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Decode `data` into `T`, unwrapping one level of string encoding if present.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            Value::String(s) => Ok(serde_json::from_str(s)?),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }

    pub fn ping() -> String {
        serde_json::json!({ "event": events::PING, "data": {} }).to_string()
    }

    pub fn pong() -> String {
        serde_json::json!({ "event": events::PONG, "data": {} }).to_string()
    }
}

/// Connection data received after establishing connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionData {
    pub socket_id: String,
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

/// Error data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    #[serde(default)]
    pub code: Option<u32>,
}

/// Subscribe and unsubscribe message structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SubscribeMessage {
    pub event: String,
    pub data: SubscribeData,
}

/// Subscribe data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SubscribeData {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

impl SubscribeMessage {
    pub fn subscribe(channel: &str, auth: Option<String>, channel_data: Option<String>) -> Self {
        Self {
            event: events::SUBSCRIBE.to_string(),
            data: SubscribeData {
                channel: channel.to_string(),
                auth,
                channel_data,
            },
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self {
            event: events::UNSUBSCRIBE.to_string(),
            data: SubscribeData {
                channel: channel.to_string(),
                auth: None,
                channel_data: None,
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client event message structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ClientEventMessage {
    pub event: String,
    pub channel: String,
    pub data: Value,
}

/// Payload of a presence `subscription_succeeded` frame
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PresenceData {
    pub presence: PresenceHash,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PresenceHash {
    #[serde(default)]
    pub ids: Vec<Value>,
    #[serde(default)]
    pub hash: HashMap<String, Value>,
}

/// Payload of `member_added` / `member_removed`, and of presence `channel_data`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MemberData {
    pub user_id: Value,
    #[serde(default)]
    pub user_info: Option<Value>,
}

/// Member ids may arrive as strings or numbers; both map to the same key.
pub(crate) fn member_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
