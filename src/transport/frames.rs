use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::json;

use crate::error::{Result, StressError};

/// Answer to a server heartbeat.
pub const HEARTBEAT_REPLY: &str = "{}";

/// Request ids for one connection. Starts at 1; a new connection starts over.
#[derive(Debug)]
pub struct CommandIds {
    next: u32,
}

impl Default for CommandIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl CommandIds {
    pub fn next(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

pub fn connect_frame(id: u32, token: &str, name: &str) -> String {
    json!({"id": id, "connect": {"token": token, "name": name}}).to_string()
}

pub fn subscribe_frame(id: u32, channel: &str) -> String {
    json!({"id": id, "subscribe": {"channel": channel}}).to_string()
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: Option<u32>,
    error: Option<ReplyError>,
    push: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    code: Option<u32>,
    message: Option<String>,
}

/// The server may batch several newline-delimited messages into one frame.
fn batched(frame: &str) -> serde_json::Result<Vec<Reply>> {
    serde_json::Deserializer::from_str(frame)
        .into_iter::<Reply>()
        .collect()
}

/// Finds the reply to `expected_id` in `frame` and returns how many
/// publications were batched alongside it.
pub fn check_reply(expected_id: u32, frame: &str) -> Result<usize> {
    let messages = batched(frame)
        .map_err(|e| StressError::Protocol(format!("malformed reply: {}", e)))?;

    let mut replied = false;
    let mut pushes = 0;
    for message in messages {
        match message.id {
            Some(id) if id == expected_id => {
                if let Some(err) = message.error {
                    return Err(StressError::Protocol(format!(
                        "command {} rejected: {} {}",
                        expected_id,
                        err.code.unwrap_or_default(),
                        err.message.unwrap_or_default()
                    )));
                }
                replied = true;
            }
            Some(id) => {
                return Err(StressError::Protocol(format!(
                    "reply id {} does not match command {}",
                    id, expected_id
                )));
            }
            None if message.push.is_some() => pushes += 1,
            None => {}
        }
    }

    if !replied {
        return Err(StressError::Protocol(format!(
            "no reply to command {} in frame",
            expected_id
        )));
    }
    Ok(pushes)
}

/// What a frame received while subscribed carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Batch {
    pub messages: usize,
    pub heartbeat: bool,
}

/// Counts the messages in a frame. Empty objects are heartbeats and
/// command replies are not messages. A frame that is not JSON counts as
/// one opaque message.
pub fn classify(frame: &str) -> Batch {
    let Ok(values) = serde_json::Deserializer::from_str(frame)
        .into_iter::<serde_json::Value>()
        .collect::<serde_json::Result<Vec<_>>>()
    else {
        return Batch {
            messages: 1,
            heartbeat: false,
        };
    };

    let mut batch = Batch::default();
    for value in values {
        match value.as_object() {
            Some(map) if map.is_empty() => batch.heartbeat = true,
            Some(map) if map.contains_key("id") => {}
            _ => batch.messages += 1,
        }
    }
    batch
}

/// Server heartbeats are empty JSON objects.
pub fn is_heartbeat(frame: &str) -> bool {
    let trimmed = frame.trim();
    if trimmed == HEARTBEAT_REPLY {
        return true;
    }
    matches!(
        serde_json::from_str::<serde_json::Value>(trimmed),
        Ok(serde_json::Value::Object(map)) if map.is_empty()
    )
}

/// Reads the command id out of a frame we sent, if it has one.
#[cfg(test)]
pub fn command_id(frame: &str) -> Option<u32> {
    let value: serde_json::Value = serde_json::from_str(frame).ok()?;
    value.get("id")?.as_u64().map(|id| id as u32)
}
