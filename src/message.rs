//! Messages exchanged with graph neighbours.
//!
//! Field names follow the wire shape the graph uses (`queryParameters`,
//! `pgConfig`, `parts`, ...). Fields the node does not interpret are kept in
//! `extra` and passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::db::{ConnectionOverride, StatementResult};

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Pre-rendered query text; wins over the node's template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Positional parameters; a non-empty array wins over `queryParameters`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Named parameters for `$name` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_parameters: Option<Value>,
    /// Run this message on a standalone connection with these overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_config: Option<ConnectionOverride>,
    /// Rebuild the node's pool before running this message.
    #[serde(default, skip_serializing_if = "is_false")]
    pub reconnect: bool,
    /// Flow-control signal: the sender can accept more output.
    #[serde(default, skip_serializing_if = "is_false")]
    pub tick: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Parts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgsql: Option<ResultMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sequencing metadata grouping the messages of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parts {
    pub id: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    /// Total number of messages; only set on the final one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub abort: bool,
    /// Parts of the inbound message this sequence was produced from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Box<Parts>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMeta {
    pub command: String,
    pub row_count: u64,
}

/// `pgsql` field: one entry for a single statement, a list for several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultMeta {
    Single(CommandMeta),
    Multi(Vec<StatementResult>),
}

impl Message {
    pub fn tick() -> Self {
        Message {
            tick: true,
            ..Message::default()
        }
    }

    pub fn with_payload(payload: Value) -> Self {
        Message {
            payload,
            ..Message::default()
        }
    }

    /// Explicit positional parameters, if a non-empty list was supplied.
    pub fn positional_params(&self) -> Option<&[Value]> {
        match &self.params {
            Some(Value::Array(values)) if !values.is_empty() => Some(values),
            _ => None,
        }
    }

    /// Named parameters, if a non-empty object was supplied.
    pub fn named_params(&self) -> Option<&Map<String, Value>> {
        match &self.query_parameters {
            Some(Value::Object(map)) if !map.is_empty() => Some(map),
            _ => None,
        }
    }

    /// Explicit query text, ignoring an empty string.
    pub fn explicit_query(&self) -> Option<&str> {
        self.query.as_deref().filter(|q| !q.is_empty())
    }

    /// Template context: the message is visible as `msg`.
    pub fn template_context(&self) -> Value {
        json!({ "msg": self })
    }

    /// Fill in a single round-trip result.
    ///
    /// Several statements concatenate their rows into `payload` and keep one
    /// metadata entry per statement.
    pub fn with_results(mut self, mut results: Vec<StatementResult>) -> Self {
        if results.len() == 1 {
            let result = results.remove(0);
            self.payload = Value::Array(result.rows);
            self.pgsql = Some(ResultMeta::Single(CommandMeta {
                command: result.command,
                row_count: result.row_count,
            }));
        } else {
            let rows = results.iter().flat_map(|r| r.rows.iter().cloned()).collect();
            self.payload = Value::Array(rows);
            self.pgsql = Some(ResultMeta::Multi(results));
        }
        self
    }

    /// Error-shaped copy of `self`: the description as payload and an abort
    /// marker on the request's parts.
    pub fn into_abort(mut self, correlation_id: &str, description: String) -> Self {
        self.payload = Value::String(description);
        self.parts = Some(Parts {
            id: Value::String(correlation_id.to_string()),
            abort: true,
            ..Parts::default()
        });
        self
    }
}

/// One emitted unit of a request's result.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub correlation_id: String,
    pub index: u64,
    pub rows: Vec<Value>,
    pub meta: CommandMeta,
    pub is_final: bool,
}

impl Batch {
    /// Build the outbound message for this batch from the request's inbound
    /// message. With `rows_per_msg` above 1 the payload is the row list,
    /// otherwise the single row (or null for an empty final page).
    pub fn into_message(self, source: &Message, rows_per_msg: i64) -> Message {
        let mut msg = source.clone();
        msg.payload = if rows_per_msg > 1 {
            Value::Array(self.rows)
        } else {
            self.rows.into_iter().next().unwrap_or(Value::Null)
        };
        msg.pgsql = Some(ResultMeta::Single(self.meta));
        msg.parts = Some(Parts {
            id: Value::String(self.correlation_id),
            kind: Some("array".to_string()),
            index: Some(self.index),
            count: self.is_final.then_some(self.index + 1),
            abort: false,
            parts: source.parts.clone().map(Box::new),
            extra: Map::new(),
        });
        msg.complete = self.is_final.then_some(true);
        msg
    }
}
