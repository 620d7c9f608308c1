//! Phoenix channel frames spoken by the realtime service.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use hypideas_types::events::{ChangeKind, RawChange};

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_ACCESS_TOKEN: &str = "access_token";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

/// Wire topic for a channel name.
pub fn channel_topic(name: &str) -> String {
    format!("realtime:{}", name)
}

/// Channel name for a wire topic.
pub fn channel_name(topic: &str) -> &str {
    topic.strip_prefix("realtime:").unwrap_or(topic)
}

/// Row changes a subscription wants: one table, optionally narrowed to rows
/// whose `column` equals a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: String,
    pub event: Option<ChangeKind>,
    pub column: Option<(String, String)>,
}

impl ChangeFilter {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            event: None,
            column: None,
        }
    }

    pub fn only(mut self, event: ChangeKind) -> Self {
        self.event = Some(event);
        self
    }

    pub fn column_eq(mut self, column: &str, value: impl Display) -> Self {
        self.column = Some((column.to_string(), value.to_string()));
        self
    }

    fn event_name(&self) -> &'static str {
        match self.event {
            None => "*",
            Some(ChangeKind::Insert) => "INSERT",
            Some(ChangeKind::Update) => "UPDATE",
            Some(ChangeKind::Delete) => "DELETE",
        }
    }

    /// Entry of the `postgres_changes` join config.
    pub fn to_config(&self) -> Value {
        let mut config = json!({
            "event": self.event_name(),
            "schema": "public",
            "table": self.table,
        });
        if let Some((column, value)) = &self.column {
            config["filter"] = json!(format!("{}=eq.{}", column, value));
        }
        config
    }

    /// Whether `change` falls under this filter. Delete events may carry
    /// only the primary key, so a missing filter column is not a mismatch.
    pub fn matches(&self, change: &RawChange) -> bool {
        if change.table != self.table {
            return false;
        }
        if self.event.is_some_and(|e| e != change.kind) {
            return false;
        }
        let Some((column, expected)) = &self.column else {
            return true;
        };
        let row = match change.kind {
            ChangeKind::Delete => &change.old_record,
            _ => &change.record,
        };
        match row.get(column) {
            None | Some(Value::Null) if change.kind == ChangeKind::Delete => true,
            Some(Value::String(s)) => s == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        }
    }
}

pub fn join_frame(name: &str, filters: &[ChangeFilter], access_token: Option<&str>, reference: u64) -> Frame {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": filters.iter().map(ChangeFilter::to_config).collect::<Vec<_>>(),
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }
    Frame {
        topic: channel_topic(name),
        event: EVENT_JOIN.into(),
        payload,
        reference: Some(reference.to_string()),
    }
}

pub fn leave_frame(name: &str, reference: u64) -> Frame {
    Frame {
        topic: channel_topic(name),
        event: EVENT_LEAVE.into(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub fn heartbeat_frame(reference: u64) -> Frame {
    Frame {
        topic: PHOENIX_TOPIC.into(),
        event: EVENT_HEARTBEAT.into(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub fn access_token_frame(name: &str, token: &str, reference: u64) -> Frame {
    Frame {
        topic: channel_topic(name),
        event: EVENT_ACCESS_TOKEN.into(),
        payload: json!({ "access_token": token }),
        reference: Some(reference.to_string()),
    }
}

/// Row change carried by a `postgres_changes` frame.
pub fn parse_change(frame: &Frame) -> Option<Result<RawChange, serde_json::Error>> {
    if frame.event != EVENT_POSTGRES_CHANGES {
        return None;
    }
    let data = frame.payload.get("data")?;
    Some(serde_json::from_value(data.clone()))
}

/// `Some(reason)` when the frame is a failed reply or a channel error.
pub fn failure(frame: &Frame) -> Option<String> {
    match frame.event.as_str() {
        EVENT_REPLY if frame.payload["status"] == "error" => Some(frame.payload["response"].to_string()),
        EVENT_ERROR => Some(format!("channel error on {}", frame.topic)),
        _ => None,
    }
}
