//! Stasis event envelope and parsing.
//!
//! ARI event payloads vary by type, so events are carried as an open envelope:
//! the discriminating `type` field, the owning stasis application, the stasis
//! argument list, and an optional channel snapshot. The raw JSON body rides
//! along so callers can reach for type-specific fields without the client
//! having to model every event shape. Unknown event types are delivered
//! unchanged.

use serde::Deserialize;
use serde_json::Value;

/// Caller id block carried inside a channel snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub name: String,
}

/// Channel snapshot as embedded in events and returned by REST calls.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub caller: Option<CallerId>,
}

/// One message from the stasis event stream.
#[derive(Debug, Clone)]
pub struct AriEvent {
    /// The `type` discriminator, e.g. "StasisStart"
    pub event_type: String,
    /// The stasis application that owns the event, when present
    pub application: Option<String>,
    /// Stasis arguments (the comma-split `appArgs` of the entering channel)
    pub args: Vec<String>,
    /// Channel snapshot, when the event carries one
    pub channel: Option<ChannelInfo>,
    /// The full event body
    pub raw: Value,
}

impl AriEvent {
    /// Parse a stream message. Returns `None` when the body is not a JSON
    /// object or has no `type` field; such messages are dropped upstream.
    pub fn parse(text: &str) -> Option<AriEvent> {
        let raw: Value = serde_json::from_str(text).ok()?;
        let event_type = raw.get("type")?.as_str()?.to_string();

        let application = raw
            .get("application")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let args = raw
            .get("args")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let channel = raw
            .get("channel")
            .and_then(|v| serde_json::from_value::<ChannelInfo>(v.clone()).ok());

        Some(AriEvent {
            event_type,
            application,
            args,
            channel,
            raw,
        })
    }
}
